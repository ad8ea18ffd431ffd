//! Team domain type

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use forgestore::{IndexValue, Record, now_ms};

use super::id::generate_id;
use super::plan::PlanProtocol;

/// Role an agent holds within a team
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamRole {
    Coder,
    Reviewer,
}

impl std::fmt::Display for TeamRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coder => write!(f, "coder"),
            Self::Reviewer => write!(f, "reviewer"),
        }
    }
}

/// Team lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TeamStatus {
    #[default]
    Assembling,
    Active,
    Completed,
    Failed,
}

impl std::fmt::Display for TeamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Assembling => write!(f, "assembling"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// An agent membership within a team
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamMember {
    pub agent_id: String,
    pub role: TeamRole,
}

/// A group of agents executing a plan together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    /// Unique identifier
    pub id: String,

    /// Owning project
    pub project_id: String,

    /// Display name
    pub name: String,

    /// Protocol the team was assembled for, if known
    pub protocol_hint: Option<PlanProtocol>,

    /// Member agents with their roles
    pub members: Vec<TeamMember>,

    /// Current status
    pub status: TeamStatus,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Team {
    /// Create a new team with generated ID
    pub fn new(project_id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        let now = now_ms();
        Self {
            id: generate_id("team", &name),
            project_id: project_id.into(),
            name,
            protocol_hint: None,
            members: Vec::new(),
            status: TeamStatus::Assembling,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the status
    pub fn set_status(&mut self, status: TeamStatus) {
        self.status = status;
        self.updated_at = now_ms();
    }

    /// Members holding the given role
    pub fn members_with_role(&self, role: TeamRole) -> Vec<&TeamMember> {
        self.members.iter().filter(|m| m.role == role).collect()
    }

    /// First reviewer on the team, if any
    pub fn reviewer(&self) -> Option<&TeamMember> {
        self.members.iter().find(|m| m.role == TeamRole::Reviewer)
    }
}

impl Record for Team {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "teams"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("project".to_string(), IndexValue::String(self.project_id.clone()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields
    }
}
