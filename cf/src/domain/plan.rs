//! ExecutionPlan and Step domain types
//!
//! A plan is a DAG of steps advanced by the orchestrator under one of four
//! coordination protocols. Steps reference a task and an agent; each
//! materialises as a run when started.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use forgestore::{IndexValue, Record, now_ms};

use super::id::generate_id;

/// Coordination protocol applied to a plan's steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PlanProtocol {
    #[default]
    Sequential,
    Parallel,
    PingPong,
    Consensus,
}

impl std::fmt::Display for PlanProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
            Self::PingPong => write!(f, "ping-pong"),
            Self::Consensus => write!(f, "consensus"),
        }
    }
}

/// Plan status; terminal statuses are monotonic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How a step's working-tree changes are delivered back to the main tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Merge automatically once the step completes
    #[default]
    Auto,
    /// Hold changes for an explicit delivery request
    Manual,
    /// Discard changes (analysis-only steps)
    None,
}

/// An execution plan: project-scoped DAG of steps under one protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Unique identifier
    pub id: String,

    /// Owning project
    pub project_id: String,

    /// Team executing the plan, if any
    pub team_id: Option<String>,

    /// Human-readable name
    pub name: String,

    /// What the plan accomplishes
    pub description: String,

    /// Coordination protocol
    pub protocol: PlanProtocol,

    /// Current status
    pub status: PlanStatus,

    /// Parallel protocol concurrency limit (0 = configured default)
    pub max_parallel: u32,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl ExecutionPlan {
    /// Create a new plan with generated ID
    pub fn new(project_id: impl Into<String>, name: impl Into<String>, protocol: PlanProtocol) -> Self {
        let name = name.into();
        let now = now_ms();
        Self {
            id: generate_id("plan", &name),
            project_id: project_id.into(),
            team_id: None,
            name,
            description: String::new(),
            protocol,
            status: PlanStatus::Pending,
            max_parallel: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the status; terminal statuses are never re-opened
    pub fn set_status(&mut self, status: PlanStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.updated_at = now_ms();
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl Record for ExecutionPlan {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "plans"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("project".to_string(), IndexValue::String(self.project_id.clone()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("protocol".to_string(), IndexValue::String(self.protocol.to_string()));
        fields
    }
}

/// Step status within a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl StepStatus {
    /// Pending is deliberately not terminal: ping-pong resets completed
    /// steps back to pending between rounds.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// A single node in a plan, bound to a task and an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier
    pub id: String,

    /// Owning plan
    pub plan_id: String,

    /// Task this step executes
    pub task_id: String,

    /// Agent assigned to the step
    pub agent_id: String,

    /// Optional mode descriptor identifier
    pub mode_id: Option<String>,

    /// Policy profile name (None = plan/configured default)
    pub profile: Option<String>,

    /// Change delivery mode
    pub delivery: DeliveryMode,

    /// Round counter (ping-pong only)
    pub round: u32,

    /// Current status
    pub status: StepStatus,

    /// Step IDs that must complete before this one starts
    pub depends_on: Vec<String>,

    /// Whether a debate has already been held for this step
    pub debated: bool,

    /// Position within the plan's ordered sequence
    pub seq: u32,

    /// Run materialised for the most recent start
    pub last_run_id: Option<String>,

    /// Error from the most recent run
    pub last_error: Option<String>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Step {
    /// Create a new step with generated ID
    pub fn new(plan_id: impl Into<String>, task_id: impl Into<String>, agent_id: impl Into<String>, seq: u32) -> Self {
        let task_id = task_id.into();
        let now = now_ms();
        Self {
            id: generate_id("step", &task_id),
            plan_id: plan_id.into(),
            task_id,
            agent_id: agent_id.into(),
            mode_id: None,
            profile: None,
            delivery: DeliveryMode::Auto,
            round: 0,
            status: StepStatus::Pending,
            depends_on: Vec::new(),
            debated: false,
            seq,
            last_run_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the status
    pub fn set_status(&mut self, status: StepStatus) {
        self.status = status;
        self.updated_at = now_ms();
    }

    /// Record the run started for this step
    pub fn set_run(&mut self, run_id: impl Into<String>) {
        self.last_run_id = Some(run_id.into());
        self.updated_at = now_ms();
    }

    /// Record an error from the step's run
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.updated_at = now_ms();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether every dependency in `completed` is satisfied
    pub fn is_ready(&self, completed: &[String]) -> bool {
        self.status == StepStatus::Pending && self.depends_on.iter().all(|d| completed.contains(d))
    }
}

impl Record for Step {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "steps"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("plan".to_string(), IndexValue::String(self.plan_id.clone()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        if let Some(ref run_id) = self.last_run_id {
            fields.insert("last_run".to_string(), IndexValue::String(run_id.clone()));
        }
        fields
    }
}

/// Validate that step dependencies form a DAG; returns the ids of a cycle
/// if one exists.
pub fn validate_step_graph(steps: &[Step]) -> Result<(), Vec<String>> {
    let mut visiting: Vec<String> = Vec::new();
    let mut done: Vec<String> = Vec::new();

    fn visit(id: &str, steps: &[Step], visiting: &mut Vec<String>, done: &mut Vec<String>) -> Result<(), Vec<String>> {
        if done.iter().any(|d| d == id) {
            return Ok(());
        }
        if visiting.iter().any(|v| v == id) {
            return Err(visiting.clone());
        }
        visiting.push(id.to_string());
        if let Some(step) = steps.iter().find(|s| s.id == id) {
            for dep in &step.depends_on {
                visit(dep, steps, visiting, done)?;
            }
        }
        visiting.pop();
        done.push(id.to_string());
        Ok(())
    }

    for step in steps {
        visit(&step.id, steps, &mut visiting, &mut done)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_new() {
        let plan = ExecutionPlan::new("proj-1", "Dark Mode", PlanProtocol::Sequential);
        assert!(plan.id.contains("-plan-"));
        assert_eq!(plan.status, PlanStatus::Pending);
        assert_eq!(plan.max_parallel, 0);
    }

    #[test]
    fn test_plan_terminal_is_monotonic() {
        let mut plan = ExecutionPlan::new("proj-1", "Test", PlanProtocol::Parallel);
        assert!(plan.set_status(PlanStatus::Running));
        assert!(plan.set_status(PlanStatus::Completed));

        // Once terminal, no transition is accepted
        assert!(!plan.set_status(PlanStatus::Running));
        assert_eq!(plan.status, PlanStatus::Completed);
        assert!(!plan.set_status(PlanStatus::Failed));
        assert_eq!(plan.status, PlanStatus::Completed);
    }

    #[test]
    fn test_step_pending_not_terminal() {
        let step = Step::new("plan-1", "task-1", "agent-1", 0);
        assert!(!step.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_step_is_ready() {
        let mut step = Step::new("plan-1", "task-1", "agent-1", 0);
        step.depends_on = vec!["s1".to_string(), "s2".to_string()];

        assert!(!step.is_ready(&["s1".to_string()]));
        assert!(step.is_ready(&["s1".to_string(), "s2".to_string()]));

        step.set_status(StepStatus::Running);
        assert!(!step.is_ready(&["s1".to_string(), "s2".to_string()]));
    }

    #[test]
    fn test_validate_step_graph_accepts_dag() {
        let mut a = Step::new("p", "t1", "ag", 0);
        let mut b = Step::new("p", "t2", "ag", 1);
        b.depends_on = vec![a.id.clone()];
        let mut c = Step::new("p", "t3", "ag", 2);
        c.depends_on = vec![a.id.clone(), b.id.clone()];
        a.depends_on = vec![];

        assert!(validate_step_graph(&[a, b, c]).is_ok());
    }

    #[test]
    fn test_validate_step_graph_detects_cycle() {
        let mut a = Step::new("p", "t1", "ag", 0);
        let mut b = Step::new("p", "t2", "ag", 1);
        let a_id = a.id.clone();
        let b_id = b.id.clone();
        a.depends_on = vec![b_id];
        b.depends_on = vec![a_id];

        assert!(validate_step_graph(&[a, b]).is_err());
    }

    #[test]
    fn test_protocol_serde_kebab_case() {
        let json = serde_json::to_string(&PlanProtocol::PingPong).unwrap();
        assert_eq!(json, "\"ping-pong\"");
        let back: PlanProtocol = serde_json::from_str("\"consensus\"").unwrap();
        assert_eq!(back, PlanProtocol::Consensus);
    }
}
