//! Run domain type
//!
//! A run is one execution attempt of a step: it owns a worker session on the
//! other side of the bus. Status transitions belong exclusively to the run
//! controller; step count and cost are monotonic while the run is live.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use forgestore::{IndexValue, Record, now_ms};

use super::id::generate_id;

/// How the worker executes tool calls against the workspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// Workspace bind-mounted read-write on the host
    #[default]
    Mount,
    /// Fully isolated container
    Sandbox,
    /// Container with a read-write workspace mount
    Hybrid,
}

impl std::fmt::Display for ExecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mount => write!(f, "mount"),
            Self::Sandbox => write!(f, "sandbox"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A single execution attempt of a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier
    pub id: String,

    /// Task being executed
    pub task_id: String,

    /// Agent executing the task
    pub agent_id: String,

    /// Owning project
    pub project_id: String,

    /// Team scope, if any
    pub team_id: Option<String>,

    /// Policy profile governing tool calls
    pub profile: String,

    /// Execution mode for the worker
    pub exec_mode: ExecMode,

    /// Current status
    pub status: RunStatus,

    /// Approved tool calls so far (monotonic while running)
    pub step_count: u32,

    /// Accumulated cost in USD (monotonic while running)
    pub cost_usd: f64,

    /// When the run started (Unix milliseconds)
    pub started_at: Option<i64>,

    /// When the run reached a terminal status (Unix milliseconds)
    pub completed_at: Option<i64>,

    /// Final output from the worker
    pub output: Option<String>,

    /// Final error from the worker
    pub error: Option<String>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Run {
    /// Create a new run with generated ID
    pub fn new(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        project_id: impl Into<String>,
        profile: impl Into<String>,
    ) -> Self {
        let task_id = task_id.into();
        let now = now_ms();
        Self {
            id: generate_id("run", &task_id),
            task_id,
            agent_id: agent_id.into(),
            project_id: project_id.into(),
            team_id: None,
            profile: profile.into(),
            exec_mode: ExecMode::default(),
            status: RunStatus::Pending,
            step_count: 0,
            cost_usd: 0.0,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mark the run as started
    pub fn mark_started(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(now_ms());
        self.updated_at = now_ms();
    }

    /// Settle a terminal status; returns false if already terminal
    pub fn settle(&mut self, status: RunStatus, output: Option<String>, error: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.output = output;
        self.error = error;
        self.completed_at = Some(now_ms());
        self.updated_at = now_ms();
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Elapsed wall-clock seconds since start (0 if not started)
    pub fn elapsed_secs(&self) -> u64 {
        self.started_at
            .map(|s| ((now_ms() - s).max(0) as u64) / 1000)
            .unwrap_or(0)
    }
}

impl Record for Run {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "runs"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("project".to_string(), IndexValue::String(self.project_id.clone()));
        fields.insert("task".to_string(), IndexValue::String(self.task_id.clone()));
        fields.insert("agent".to_string(), IndexValue::String(self.agent_id.clone()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields
    }
}
