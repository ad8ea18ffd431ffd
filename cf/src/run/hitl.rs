//! Human-in-the-loop approval brokering
//!
//! `ask` decisions suspend here: a single-slot decision channel is
//! registered under (run, call-id), the request is broadcast to the UI
//! and fanned out to every feedback provider, and the first response
//! wins. Late responders hit a full buffer and are dropped.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::policy::PermissionDecision;

/// An approval request shown to responders
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub run_id: String,
    pub call_id: String,
    pub tool: String,
    pub command: Option<String>,
    pub path: Option<String>,
}

/// A responder's answer
#[derive(Debug, Clone)]
pub struct HitlResponse {
    /// Who answered ("ui", or a provider name)
    pub source: String,
    pub decision: PermissionDecision,
}

/// Outcome of an approval wait
#[derive(Debug, Clone)]
pub enum HitlOutcome {
    Decided(HitlResponse),
    Timeout,
    Cancelled,
}

/// An external channel that can obtain approval decisions (chat, email, ...)
#[async_trait]
pub trait FeedbackProvider: Send + Sync {
    /// Provider name for the audit log
    fn name(&self) -> &str;

    /// Attempt to obtain a decision; None means the provider gave up
    async fn request_decision(&self, request: &ApprovalRequest) -> Option<PermissionDecision>;
}

/// Decision-slot registry keyed by (run, call-id)
#[derive(Default)]
pub struct HitlBroker {
    slots: Mutex<HashMap<(String, String), mpsc::Sender<HitlResponse>>>,
}

impl HitlBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single-slot decision channel
    pub async fn register(&self, run_id: &str, call_id: &str) -> mpsc::Receiver<HitlResponse> {
        let (tx, rx) = mpsc::channel(1);
        self.slots
            .lock()
            .await
            .insert((run_id.to_string(), call_id.to_string()), tx);
        rx
    }

    /// Deliver a decision; returns whether this response won the slot
    pub async fn resolve(&self, run_id: &str, call_id: &str, decision: PermissionDecision, source: &str) -> bool {
        let slots = self.slots.lock().await;
        let Some(tx) = slots.get(&(run_id.to_string(), call_id.to_string())) else {
            debug!(%run_id, %call_id, %source, "hitl: no pending slot, response dropped");
            return false;
        };
        let accepted = tx
            .try_send(HitlResponse {
                source: source.to_string(),
                decision,
            })
            .is_ok();
        if !accepted {
            debug!(%run_id, %call_id, %source, "hitl: slot already filled, response dropped");
        }
        accepted
    }

    /// Remove the slot; idempotent
    pub async fn remove(&self, run_id: &str, call_id: &str) {
        self.slots
            .lock()
            .await
            .remove(&(run_id.to_string(), call_id.to_string()));
    }

    /// Wait for the first response, the deadline, or cancellation
    pub async fn wait(
        &self,
        rx: &mut mpsc::Receiver<HitlResponse>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> HitlOutcome {
        tokio::select! {
            response = rx.recv() => match response {
                Some(response) => HitlOutcome::Decided(response),
                None => HitlOutcome::Cancelled,
            },
            _ = tokio::time::sleep(timeout) => HitlOutcome::Timeout,
            _ = cancel.cancelled() => HitlOutcome::Cancelled,
        }
    }
}
