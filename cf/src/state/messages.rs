//! State manager commands and errors

use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{
    Agent, AgentStatus, ExecutionPlan, ReviewPolicy, ReviewRecord, Run, RunEvent, RunStatus, SharedContext, Step,
    Task, TaskStatus, Team,
};

/// Errors from state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Conflict(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Channel error")]
    ChannelError,
}

impl From<forgestore::StoreError> for StateError {
    fn from(err: forgestore::StoreError) -> Self {
        match err {
            forgestore::StoreError::NotFound { collection, id } => StateError::NotFound(format!("{}/{}", collection, id)),
            forgestore::StoreError::Conflict { collection, id } => StateError::Conflict(format!("{}/{}", collection, id)),
            forgestore::StoreError::Serialization(msg) => StateError::StoreError(msg),
        }
    }
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    // Plan operations
    CreatePlan {
        plan: ExecutionPlan,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetPlan {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<ExecutionPlan>>>,
    },
    UpdatePlan {
        plan: ExecutionPlan,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListPlans {
        project_filter: Option<String>,
        status_filter: Option<String>,
        reply: oneshot::Sender<StateResponse<Vec<ExecutionPlan>>>,
    },

    // Step operations
    CreateStep {
        step: Step,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetStep {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<Step>>>,
    },
    UpdateStep {
        step: Step,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListSteps {
        plan_id: String,
        reply: oneshot::Sender<StateResponse<Vec<Step>>>,
    },
    FindStepByRun {
        run_id: String,
        reply: oneshot::Sender<StateResponse<Option<Step>>>,
    },

    // Run operations
    CreateRun {
        run: Run,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetRun {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<Run>>>,
    },
    UpdateRun {
        run: Run,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    /// Atomic step-count increment; returns the new count
    IncrementRunSteps {
        run_id: String,
        reply: oneshot::Sender<StateResponse<u32>>,
    },
    /// Atomic cost accumulation; returns the new total
    AddRunCost {
        run_id: String,
        delta_usd: f64,
        reply: oneshot::Sender<StateResponse<f64>>,
    },
    /// Terminal settlement; succeeds at most once per run. Returns the
    /// settled run, or None when the run was already terminal.
    SettleRun {
        run_id: String,
        status: RunStatus,
        output: Option<String>,
        error: Option<String>,
        step_count: Option<u32>,
        cost_usd: Option<f64>,
        reply: oneshot::Sender<StateResponse<Option<Run>>>,
    },

    // Task operations
    CreateTask {
        task: Task,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetTask {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<Task>>>,
    },
    SetTaskStatus {
        id: String,
        status: TaskStatus,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListTasks {
        project_id: String,
        reply: oneshot::Sender<StateResponse<Vec<Task>>>,
    },

    // Agent operations
    CreateAgent {
        agent: Agent,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetAgent {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<Agent>>>,
    },
    SetAgentStatus {
        id: String,
        status: AgentStatus,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListAgents {
        project_id: String,
        reply: oneshot::Sender<StateResponse<Vec<Agent>>>,
    },

    // Team operations
    CreateTeam {
        team: Team,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetTeam {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<Team>>>,
    },
    UpdateTeam {
        team: Team,
        reply: oneshot::Sender<StateResponse<()>>,
    },

    // Shared-context operations
    CreateContext {
        context: SharedContext,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    GetContextForTeam {
        team_id: String,
        reply: oneshot::Sender<StateResponse<Option<SharedContext>>>,
    },
    /// Append an item inside the actor; returns the new version
    AppendContextItem {
        team_id: String,
        key: String,
        value: String,
        author: String,
        token_budget: u64,
        reply: oneshot::Sender<StateResponse<u64>>,
    },

    // Run-event operations
    AppendRunEvent {
        event: RunEvent,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListRunEvents {
        run_id: String,
        reply: oneshot::Sender<StateResponse<Vec<RunEvent>>>,
    },

    // Review operations
    CreateReviewPolicy {
        policy: ReviewPolicy,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    UpdateReviewPolicy {
        policy: ReviewPolicy,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListReviewPolicies {
        project_filter: Option<String>,
        reply: oneshot::Sender<StateResponse<Vec<ReviewPolicy>>>,
    },
    /// Atomic commit-counter bump with threshold reset; returns whether
    /// the policy fired
    BumpCommitCounter {
        policy_id: String,
        commits: u32,
        reply: oneshot::Sender<StateResponse<bool>>,
    },
    CreateReviewRecord {
        record: ReviewRecord,
        reply: oneshot::Sender<StateResponse<String>>,
    },
    UpdateReviewRecord {
        record: ReviewRecord,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    FindReviewByPlan {
        plan_id: String,
        reply: oneshot::Sender<StateResponse<Option<ReviewRecord>>>,
    },

    /// Shut the actor down
    Shutdown,
}
