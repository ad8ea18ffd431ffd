//! Shared-context store
//!
//! Team-scoped key-value log with monotonic versioning. The append happens
//! inside the state actor (which is what makes the version the writer
//! observes atomic); the broadcast carrying that version happens outside.
//! Consumers tolerate out-of-order broadcasts: the stored item is the
//! source of truth.

use std::sync::Arc;

use eyre::{Context, Result};
use serde_json::json;
use tracing::debug;

use crate::bus::{MessageBus, subjects};
use crate::domain::{SharedContext, SharedContextItem};
use crate::events::{EventBus, ForgeEvent};
use crate::state::StateManager;

/// Team-scoped shared context operations
#[derive(Clone)]
pub struct SharedContextStore {
    state: StateManager,
    bus: Arc<dyn MessageBus>,
    events: EventBus,

    /// Per-team token budget; 0 disables eviction
    token_budget: u64,
}

impl SharedContextStore {
    pub fn new(state: StateManager, bus: Arc<dyn MessageBus>, events: EventBus, token_budget: u64) -> Self {
        Self {
            state,
            bus,
            events,
            token_budget,
        }
    }

    /// Initialise an empty context for a team (version = 1)
    pub async fn init(&self, team_id: &str, project_id: &str) -> Result<SharedContext> {
        let context = SharedContext::new(team_id, project_id);
        self.state
            .create_context(context.clone())
            .await
            .context("Failed to create shared context")?;
        debug!(%team_id, "shared context initialised");
        Ok(context)
    }

    /// Append an item; the broadcast carries the version returned by the
    /// atomic append.
    pub async fn add_item(&self, team_id: &str, key: &str, value: &str, author: &str) -> Result<u64> {
        let version = self
            .state
            .append_context_item(team_id, key, value, author, self.token_budget)
            .await
            .context("Failed to append shared-context item")?;

        // Best-effort broadcasts; failures never unwind the write
        let payload = json!({
            "team-id": team_id,
            "key": key,
            "author": author,
            "version": version,
        });
        if let Err(e) = self.bus.publish(subjects::SHARED_UPDATED, payload).await {
            debug!(error = %e, "shared-context broadcast failed");
        }
        self.events.emit(ForgeEvent::SharedContextUpdate {
            team_id: team_id.to_string(),
            key: key.to_string(),
            author: author.to_string(),
            version,
        });

        Ok(version)
    }

    /// Full item list for a team
    pub async fn get(&self, team_id: &str) -> Result<Vec<SharedContextItem>> {
        let context = self
            .state
            .get_context_for_team(team_id)
            .await
            .context("Failed to load shared context")?;
        Ok(context.map(|c| c.items).unwrap_or_default())
    }
}
