//! SharedContext domain type
//!
//! A team-scoped, version-stamped key-value log used to propagate step
//! outputs and debate syntheses between agents within a plan.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use forgestore::{IndexValue, Record, now_ms};

use super::id::generate_id;

/// Rough token estimate for budget accounting (~4 chars per token)
pub fn estimate_tokens(value: &str) -> u32 {
    ((value.len() as u32) / 4).max(1)
}

/// One entry in a team's shared context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedContextItem {
    pub key: String,
    pub value: String,

    /// Agent (or component) that wrote the item
    pub author: String,

    /// Estimated token footprint of the value
    pub token_estimate: u32,

    /// Insertion time (Unix milliseconds)
    pub added_at: i64,
}

/// The per-team shared context log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedContext {
    /// Unique identifier
    pub id: String,

    /// Owning team
    pub team_id: String,

    /// Owning project
    pub project_id: String,

    /// Monotonic version, incremented on every write
    pub version: u64,

    /// Ordered item log, oldest first
    pub items: Vec<SharedContextItem>,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl SharedContext {
    /// Initialise an empty context for a team
    pub fn new(team_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        let team_id = team_id.into();
        let now = now_ms();
        Self {
            id: generate_id("ctx", &team_id),
            team_id,
            project_id: project_id.into(),
            version: 1,
            items: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append an item and bump the version; returns the new version
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>, author: impl Into<String>) -> u64 {
        let value = value.into();
        self.items.push(SharedContextItem {
            key: key.into(),
            token_estimate: estimate_tokens(&value),
            value,
            author: author.into(),
            added_at: now_ms(),
        });
        self.version += 1;
        self.updated_at = now_ms();
        self.version
    }

    /// Total estimated tokens across all items
    pub fn token_total(&self) -> u64 {
        self.items.iter().map(|i| i.token_estimate as u64).sum()
    }

    /// Drop oldest items until the total estimate fits the budget.
    /// Returns the number of evicted items.
    pub fn evict_to_budget(&mut self, token_budget: u64) -> usize {
        let mut evicted = 0;
        while self.items.len() > 1 && self.token_total() > token_budget {
            self.items.remove(0);
            evicted += 1;
        }
        if evicted > 0 {
            self.updated_at = now_ms();
        }
        evicted
    }
}

impl Record for SharedContext {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "shared_contexts"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("team".to_string(), IndexValue::String(self.team_id.clone()));
        fields.insert("project".to_string(), IndexValue::String(self.project_id.clone()));
        fields
    }
}
