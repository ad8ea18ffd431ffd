//! Review policy and review record domain types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use forgestore::{IndexValue, Record, now_ms};

use super::id::generate_id;

/// What fires a review policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewTrigger {
    /// Every N commits pushed to the project
    CommitCount,
    /// Cron schedule
    Cron,
    /// Before merging into a protected branch
    PreMerge,
}

impl std::fmt::Display for ReviewTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CommitCount => write!(f, "commit-count"),
            Self::Cron => write!(f, "cron"),
            Self::PreMerge => write!(f, "pre-merge"),
        }
    }
}

/// A standing policy that spawns review plans
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewPolicy {
    /// Unique identifier
    pub id: String,

    /// Owning project
    pub project_id: String,

    /// What fires the policy
    pub trigger: ReviewTrigger,

    /// Commit threshold (commit-count trigger)
    pub threshold: u32,

    /// Target branch (pre-merge trigger)
    pub branch: Option<String>,

    /// Cron expression (cron trigger)
    pub cron_expr: Option<String>,

    /// Pipeline template to instantiate
    pub pipeline: String,

    /// Commits seen since the last fired review (commit-count trigger)
    pub commit_counter: u32,

    /// Whether the policy is active
    pub enabled: bool,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds); cron scheduling anchors here
    pub updated_at: i64,
}

impl ReviewPolicy {
    /// Create a new policy with generated ID
    pub fn new(project_id: impl Into<String>, trigger: ReviewTrigger) -> Self {
        let project_id = project_id.into();
        let now = now_ms();
        Self {
            id: generate_id("rpolicy", &project_id),
            project_id,
            trigger,
            threshold: 0,
            branch: None,
            cron_expr: None,
            pipeline: "review-only".to_string(),
            commit_counter: 0,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bump updated_at (cron anchor)
    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

impl Record for ReviewPolicy {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "review_policies"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("project".to_string(), IndexValue::String(self.project_id.clone()));
        fields.insert("trigger".to_string(), IndexValue::String(self.trigger.to_string()));
        fields.insert("enabled".to_string(), IndexValue::Bool(self.enabled));
        fields
    }
}

/// Status of a spawned review
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A review spawned by a policy, tracking its plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRecord {
    /// Unique identifier
    pub id: String,

    /// Owning project
    pub project_id: String,

    /// Policy that spawned the review
    pub policy_id: String,

    /// Plan executing the review
    pub plan_id: String,

    /// Current status
    pub status: ReviewStatus,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl ReviewRecord {
    /// Create a new record with generated ID
    pub fn new(project_id: impl Into<String>, policy_id: impl Into<String>, plan_id: impl Into<String>) -> Self {
        let project_id = project_id.into();
        let now = now_ms();
        Self {
            id: generate_id("review", &project_id),
            project_id,
            policy_id: policy_id.into(),
            plan_id: plan_id.into(),
            status: ReviewStatus::Running,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the status
    pub fn set_status(&mut self, status: ReviewStatus) {
        self.status = status;
        self.updated_at = now_ms();
    }
}

impl Record for ReviewRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "reviews"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("project".to_string(), IndexValue::String(self.project_id.clone()));
        fields.insert("plan".to_string(), IndexValue::String(self.plan_id.clone()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields
    }
}
