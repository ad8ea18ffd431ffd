//! Correlator - generic request/reply plumbing for the message bus
//!
//! Every bus RPC follows the same shape: publish a request carrying a fresh
//! random correlation id, register a waiter under that id, suspend until the
//! subscription callback delivers the reply. Entries are self-cleaning:
//! the waiter removes its entry on wake or timeout, the deliverer removes it
//! on delivery, and a second delivery for the same id drops silently.
//!
//! A small circuit breaker records the last RPC failure so callers can fail
//! fast instead of publishing doomed requests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default circuit-breaker cooldown after a failure
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// Errors from correlator waits
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("Correlation id already registered: {0}")]
    Conflict(String),

    #[error("Timed out waiting for reply")]
    Timeout,

    #[error("Wait cancelled")]
    Cancelled,

    #[error("Reply channel closed")]
    Closed,
}

/// Generate a correlation id: 16 random bytes, hex-encoded
pub fn generate_correlation_id() -> String {
    let bytes: [u8; 16] = rand::random();
    let mut id = String::with_capacity(32);
    for b in bytes {
        id.push_str(&format!("{:02x}", b));
    }
    id
}

/// Receive side of a registered correlation entry
#[derive(Debug)]
pub struct ReplyHandle {
    id: String,
    rx: mpsc::Receiver<Value>,
}

impl ReplyHandle {
    /// The correlation id this handle waits on
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Request/reply correlation table with circuit breaker
pub struct Correlator {
    entries: Mutex<HashMap<String, mpsc::Sender<Value>>>,
    last_failure: Mutex<Option<Instant>>,
    cooldown: Duration,
}

impl Correlator {
    /// Create a correlator with the default cooldown
    pub fn new() -> Self {
        Self::with_cooldown(DEFAULT_COOLDOWN)
    }

    /// Create a correlator with a custom circuit-breaker cooldown
    pub fn with_cooldown(cooldown: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            last_failure: Mutex::new(None),
            cooldown,
        }
    }

    /// Allocate a single-slot delivery channel for the id
    pub fn register(&self, id: &str) -> Result<ReplyHandle, CorrelatorError> {
        let mut entries = self.entries.lock().expect("correlator lock poisoned");
        if entries.contains_key(id) {
            return Err(CorrelatorError::Conflict(id.to_string()));
        }
        let (tx, rx) = mpsc::channel(1);
        entries.insert(id.to_string(), tx);
        debug!(%id, "correlator: registered");
        Ok(ReplyHandle {
            id: id.to_string(),
            rx,
        })
    }

    /// Deliver a reply; drops silently when there is no waiter or the
    /// reply was already delivered
    pub fn deliver(&self, id: &str, payload: Value) {
        let tx = {
            let mut entries = self.entries.lock().expect("correlator lock poisoned");
            entries.remove(id)
        };
        match tx {
            Some(tx) => {
                if tx.try_send(payload).is_err() {
                    debug!(%id, "correlator: waiter gone, reply dropped");
                }
            }
            None => debug!(%id, "correlator: no waiter, reply dropped"),
        }
    }

    /// Remove an entry; idempotent
    pub fn unregister(&self, id: &str) {
        self.entries.lock().expect("correlator lock poisoned").remove(id);
    }

    /// Suspend until the reply, the deadline, or cancellation
    pub async fn wait(
        &self,
        mut handle: ReplyHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, CorrelatorError> {
        let result = tokio::select! {
            reply = handle.rx.recv() => match reply {
                Some(payload) => Ok(payload),
                None => Err(CorrelatorError::Closed),
            },
            _ = tokio::time::sleep(timeout) => Err(CorrelatorError::Timeout),
            _ = cancel.cancelled() => Err(CorrelatorError::Cancelled),
        };
        self.unregister(&handle.id);
        result
    }

    /// Record an RPC failure, opening the circuit for the cooldown window
    pub fn mark_failure(&self) {
        *self.last_failure.lock().expect("correlator lock poisoned") = Some(Instant::now());
    }

    /// Whether the circuit is currently open
    pub fn is_unhealthy(&self) -> bool {
        self.last_failure
            .lock()
            .expect("correlator lock poisoned")
            .map(|t| t.elapsed() < self.cooldown)
            .unwrap_or(false)
    }

    /// Number of registered entries (for introspection)
    pub fn pending(&self) -> usize {
        self.entries.lock().expect("correlator lock poisoned").len()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}
