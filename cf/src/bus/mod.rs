//! Message-bus contract
//!
//! The control plane talks to remote execution workers over a
//! request/reply message bus. The broker itself is an external
//! collaborator; this module defines the contract the core consumes plus
//! [`MemoryBus`], the in-process implementation used for wiring and tests.

mod memory;
pub mod subjects;

pub use memory::MemoryBus;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from bus operations
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bus closed")]
    Closed,

    #[error("Publish failed on {subject}: {reason}")]
    PublishFailed { subject: String, reason: String },
}

/// A message delivered to a subscriber
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Value,
}

/// A live subscription; messages arrive in publish order
pub struct BusSubscription {
    rx: mpsc::Receiver<BusMessage>,
}

impl BusSubscription {
    pub(crate) fn new(rx: mpsc::Receiver<BusMessage>) -> Self {
        Self { rx }
    }

    /// Receive the next message; None when the bus shuts down
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}

/// The bus contract the core consumes
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a JSON payload on a subject; fire-and-forget
    async fn publish(&self, subject: &str, payload: Value) -> Result<(), BusError>;

    /// Subscribe to a subject; every published message is fanned out to
    /// every subscriber
    async fn subscribe(&self, subject: &str) -> Result<BusSubscription, BusError>;
}
