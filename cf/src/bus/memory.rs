//! In-process bus implementation
//!
//! Per-subject fan-out over tokio channels. Subscribers that fall behind
//! or drop their receiver are pruned on the next publish.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

use super::{BusError, BusMessage, BusSubscription, MessageBus};

/// Per-subscriber channel capacity
const CHANNEL_CAPACITY: usize = 256;

/// In-process message bus
#[derive(Clone, Default)]
pub struct MemoryBus {
    subscribers: Arc<RwLock<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Value) -> Result<(), BusError> {
        // Snapshot the senders so no lock is held across a send: a full
        // subscriber channel must not wedge unrelated publishers.
        let senders: Vec<mpsc::Sender<BusMessage>> = {
            let subscribers = self.subscribers.read().await;
            match subscribers.get(subject) {
                Some(senders) => senders.clone(),
                None => {
                    debug!(%subject, "publish: no subscribers");
                    return Ok(());
                }
            }
        };

        let msg = BusMessage {
            subject: subject.to_string(),
            payload,
        };

        let mut any_closed = false;
        for tx in &senders {
            if tx.send(msg.clone()).await.is_err() {
                any_closed = true;
            }
        }
        if any_closed {
            let mut subscribers = self.subscribers.write().await;
            if let Some(senders) = subscribers.get_mut(subject) {
                senders.retain(|tx| !tx.is_closed());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<BusSubscription, BusError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.subscribers
            .write()
            .await
            .entry(subject.to_string())
            .or_default()
            .push(tx);
        debug!(%subject, "subscribe: registered");
        Ok(BusSubscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("run.start").await.unwrap();

        bus.publish("run.start", json!({"run-id": "r1"})).await.unwrap();

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.subject, "run.start");
        assert_eq!(msg.payload["run-id"], "r1");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = MemoryBus::new();
        bus.publish("run.output", json!({})).await.unwrap();
    }

    #[tokio::test]
    async fn test_fan_out_to_multiple_subscribers() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("shared.updated").await.unwrap();
        let mut b = bus.subscribe("shared.updated").await.unwrap();

        bus.publish("shared.updated", json!({"version": 2})).await.unwrap();

        assert_eq!(a.recv().await.unwrap().payload["version"], 2);
        assert_eq!(b.recv().await.unwrap().payload["version"], 2);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("run.complete").await.unwrap();
        drop(sub);

        // Publishing after the receiver is gone must not error
        bus.publish("run.complete", json!({})).await.unwrap();
        bus.publish("run.complete", json!({})).await.unwrap();
    }

    #[tokio::test]
    async fn test_subject_isolation() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("graph.search.result").await.unwrap();

        bus.publish("retrieval.search.result", json!({})).await.unwrap();
        assert!(sub.try_recv().is_none());
    }
}
