//! Retrieval, graph and memory clients
//!
//! Thin correlator users: each RPC publishes a request carrying a fresh
//! correlation id and suspends on the correlator until the worker's
//! result arrives. A circuit breaker per client fails fast for the
//! cooldown window after any failure.

mod client;
mod graph;
mod memory;

pub use client::{IndexStatus, RetrievalClient, SearchHit};
pub use graph::GraphClient;
pub use memory::MemoryClient;

use thiserror::Error;

/// Errors from remote-RPC clients
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Circuit open, request not published")]
    Unhealthy,

    #[error("Timed out waiting for worker result")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Malformed worker result: {0}")]
    Malformed(String),
}

impl From<crate::correlator::CorrelatorError> for RpcError {
    fn from(err: crate::correlator::CorrelatorError) -> Self {
        match err {
            crate::correlator::CorrelatorError::Timeout => RpcError::Timeout,
            crate::correlator::CorrelatorError::Cancelled => RpcError::Cancelled,
            other => RpcError::Malformed(other.to_string()),
        }
    }
}
