//! Agent domain type

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use forgestore::{IndexValue, Record, now_ms};

use super::id::generate_id;

/// Agent availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Running,
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// A coding agent registered with a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique identifier
    pub id: String,

    /// Owning project
    pub project_id: String,

    /// Display name
    pub name: String,

    /// Worker backend identifier (e.g. "claude", "aider")
    pub backend: String,

    /// Current availability
    pub status: AgentStatus,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Agent {
    /// Create a new agent with generated ID
    pub fn new(project_id: impl Into<String>, name: impl Into<String>, backend: impl Into<String>) -> Self {
        let name = name.into();
        let now = now_ms();
        Self {
            id: generate_id("agent", &name),
            project_id: project_id.into(),
            name,
            backend: backend.into(),
            status: AgentStatus::Idle,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the status
    pub fn set_status(&mut self, status: AgentStatus) {
        self.status = status;
        self.updated_at = now_ms();
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle
    }
}

impl Record for Agent {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "agents"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("project".to_string(), IndexValue::String(self.project_id.clone()));
        fields.insert("status".to_string(), IndexValue::String(self.status.to_string()));
        fields.insert("backend".to_string(), IndexValue::String(self.backend.clone()));
        fields
    }
}
