//! Run control plane
//!
//! The per-run state machine bridging the orchestrator and remote workers
//! over the bus: run starts, tool-call policy decisions with HITL
//! escalation, stall detection, termination budgets, and terminal
//! settlement feeding the orchestrator's completion callback.

mod controller;
mod hitl;
mod messages;
mod stall;

pub use controller::{RunCompletionCallback, RunController, RunStartRequest};
pub use hitl::{ApprovalRequest, FeedbackProvider, HitlBroker, HitlOutcome, HitlResponse};
pub use messages::{
    ContextPackItem, RunCompleteMsg, RunOutputMsg, RunStartPayload, ToolCallRequestMsg, ToolCallResponseMsg,
    ToolCallResultMsg,
};
pub use stall::{StallWindow, hash_result};
