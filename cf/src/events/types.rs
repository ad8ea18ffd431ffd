//! Broadcast event types

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{AgentStatus, PlanStatus, ReviewStatus, RunStatus, StepStatus, TeamStatus};

/// An event broadcast to status subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ForgeEvent {
    RunStatus {
        run_id: String,
        status: RunStatus,
    },

    PlanStatus {
        plan_id: String,
        status: PlanStatus,
    },

    PlanStepStatus {
        plan_id: String,
        step_id: String,
        status: StepStatus,
    },

    ToolCallStatus {
        run_id: String,
        call_id: String,
        tool: String,
        decision: String,
        reason: Option<String>,
    },

    AgentStatus {
        agent_id: String,
        status: AgentStatus,
    },

    TeamStatus {
        team_id: String,
        status: TeamStatus,
    },

    /// A tool call is waiting on a human decision
    PermissionRequest {
        run_id: String,
        call_id: String,
        tool: String,
        command: Option<String>,
        path: Option<String>,
    },

    SharedContextUpdate {
        team_id: String,
        key: String,
        author: String,
        version: u64,
    },

    ReviewRouterDecision {
        step_id: String,
        needs_review: bool,
        confidence: f64,
        reason: String,
    },

    ReviewStatus {
        review_id: String,
        status: ReviewStatus,
    },

    DebateStatus {
        plan_id: String,
        parent_step_id: String,
        status: PlanStatus,
    },

    RetrievalStatus {
        project_id: String,
        status: String,
    },

    GraphStatus {
        project_id: String,
        status: String,
    },

    /// A line of worker output relayed from the bus
    RunOutput {
        task_id: String,
        line: String,
        stream: String,
    },

    Handoff {
        source_agent: String,
        target_agent: String,
        plan_id: String,
        payload: Value,
    },
}

impl ForgeEvent {
    /// Short kind string for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStatus { .. } => "run.status",
            Self::PlanStatus { .. } => "plan.status",
            Self::PlanStepStatus { .. } => "plan.step.status",
            Self::ToolCallStatus { .. } => "tool-call.status",
            Self::AgentStatus { .. } => "agent.status",
            Self::TeamStatus { .. } => "team.status",
            Self::PermissionRequest { .. } => "permission-request",
            Self::SharedContextUpdate { .. } => "shared-context.update",
            Self::ReviewRouterDecision { .. } => "review-router.decision",
            Self::ReviewStatus { .. } => "review.status",
            Self::DebateStatus { .. } => "debate.status",
            Self::RetrievalStatus { .. } => "retrieval.status",
            Self::GraphStatus { .. } => "graph.status",
            Self::RunOutput { .. } => "run.output",
            Self::Handoff { .. } => "handoff",
        }
    }
}
