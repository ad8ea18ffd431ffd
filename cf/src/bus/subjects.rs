//! Bus subject names
//!
//! Every request subject is paired with a result/response subject carrying
//! the originating request-id.

pub const RUN_START: &str = "run.start";
pub const RUN_TOOL_CALL_REQUEST: &str = "run.tool-call.request";
pub const RUN_TOOL_CALL_RESPONSE: &str = "run.tool-call.response";
pub const RUN_TOOL_CALL_RESULT: &str = "run.tool-call.result";
pub const RUN_OUTPUT: &str = "run.output";
pub const RUN_COMPLETE: &str = "run.complete";
pub const RUN_CANCEL: &str = "run.cancel";

pub const RETRIEVAL_INDEX_REQUEST: &str = "retrieval.index.request";
pub const RETRIEVAL_INDEX_RESULT: &str = "retrieval.index.result";
pub const RETRIEVAL_SEARCH_REQUEST: &str = "retrieval.search.request";
pub const RETRIEVAL_SEARCH_RESULT: &str = "retrieval.search.result";

pub const SUBAGENT_SEARCH_REQUEST: &str = "subagent.search.request";
pub const SUBAGENT_SEARCH_RESULT: &str = "subagent.search.result";

pub const GRAPH_BUILD_REQUEST: &str = "graph.build.request";
pub const GRAPH_BUILD_RESULT: &str = "graph.build.result";
pub const GRAPH_SEARCH_REQUEST: &str = "graph.search.request";
pub const GRAPH_SEARCH_RESULT: &str = "graph.search.result";

pub const SHARED_UPDATED: &str = "shared.updated";
pub const HANDOFF_REQUEST: &str = "handoff.request";
pub const EVAL_REQUEST: &str = "eval.gemmas.request";

pub const MEMORY_STORE: &str = "memory.store";
pub const MEMORY_RECALL: &str = "memory.recall";
pub const MEMORY_RECALL_RESULT: &str = "memory.recall.result";
