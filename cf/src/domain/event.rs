//! RunEvent domain type
//!
//! Append-only per-run records: policy decisions, tool-call results, HITL
//! responses and lifecycle transitions. The evaluation dispatcher replays
//! them after plan completion; the HITL path uses them as its audit log.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use forgestore::{IndexValue, Record, now_ms};

use super::id::generate_id;

/// Process-wide append counter; millisecond timestamps tie too often to
/// order a trace.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// One event in a run's trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// Unique identifier
    pub id: String,

    /// Owning run
    pub run_id: String,

    /// Event kind, e.g. "tool-call.request", "tool-call.result"
    pub kind: String,

    /// Event payload
    pub payload: Value,

    /// Append order within the process
    pub seq: u64,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,
}

impl RunEvent {
    /// Create a new event with generated ID
    pub fn new(run_id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        let kind = kind.into();
        Self {
            id: generate_id("event", &kind),
            run_id: run_id.into(),
            kind,
            payload,
            seq: EVENT_SEQ.fetch_add(1, Ordering::Relaxed),
            created_at: now_ms(),
        }
    }
}

impl Record for RunEvent {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.created_at
    }

    fn collection_name() -> &'static str {
        "run_events"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("run".to_string(), IndexValue::String(self.run_id.clone()));
        fields.insert("kind".to_string(), IndexValue::String(self.kind.clone()));
        fields
    }
}
