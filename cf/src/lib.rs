//! CodeForge - multi-agent execution orchestrator for coding agents
//!
//! CodeForge decomposes user-supplied features into dependency-graphed
//! subtasks, schedules them across pools of coding agents under four
//! coordination protocols (sequential, parallel, ping-pong, consensus),
//! enforces per-step tool-use policies with human-in-the-loop approvals,
//! and correlates asynchronous results streaming back from remote
//! execution workers over a request/reply message bus.
//!
//! # Core flow
//!
//! A feature enters the [`planning`] decomposer, which produces tasks and
//! a plan. The [`orchestrator`] advances the plan step by step; each step
//! becomes a [`run`] driven against a remote worker over the [`bus`].
//! Tool calls are checked by the [`policy`] engine (escalating to humans
//! when a rule says ask), bracketed by [`checkpoint`] snapshots, and
//! bounded by per-profile termination budgets. Terminal runs feed back
//! into plan advancement; terminal plans fire registered callbacks
//! ([`evaluation`] dispatch, [`review`] bookkeeping, debate resumption).

#![allow(dead_code)]

pub mod bus;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod context;
pub mod correlator;
pub mod daemon;
pub mod domain;
pub mod evaluation;
pub mod events;
pub mod llm;
pub mod orchestrator;
pub mod planning;
pub mod policy;
pub mod retrieval;
pub mod review;
pub mod run;
pub mod sandbox;
pub mod state;
pub mod team;

// Re-export commonly used types
pub use bus::{BusError, BusMessage, BusSubscription, MemoryBus, MessageBus};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointLedger, GitPool};
pub use config::Config;
pub use context::SharedContextStore;
pub use correlator::{Correlator, CorrelatorError, generate_correlation_id};
pub use daemon::Daemon;
pub use domain::{
    Agent, AgentStatus, DeliveryMode, ExecMode, ExecutionPlan, PlanProtocol, PlanStatus, Run, RunEvent, RunStatus,
    SharedContext, Step, StepStatus, Task, TaskStatus, Team, TeamRole, TeamStatus,
};
pub use evaluation::EvaluationDispatcher;
pub use events::{EventBus, ForgeEvent};
pub use llm::{AnthropicClient, LlmClient, LlmError};
pub use orchestrator::{CreatePlanRequest, CreateStepSpec, Orchestrator, PlanCallback};
pub use planning::{DecomposeRequest, DecomposedFeature, Decomposer, sanitize_prompt_text};
pub use policy::{
    PermissionDecision, PermissionMode, PermissionRule, PolicyEngine, PolicyProfile, TerminationBudget, ToolCall,
};
pub use retrieval::{GraphClient, MemoryClient, RetrievalClient, RpcError};
pub use review::{ReviewPolicyEngine, ReviewRouter};
pub use run::{ApprovalRequest, FeedbackProvider, RunController, RunStartRequest};
pub use sandbox::{SandboxLimits, SandboxManager};
pub use state::{StateError, StateManager};
pub use team::{CreateTeamRequest, PoolManager, Strategy};
