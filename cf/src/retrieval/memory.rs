//! Memory client: store and recall over the bus

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bus::{MessageBus, subjects};
use crate::correlator::{Correlator, generate_correlation_id};

use super::RpcError;

/// Client for the memory worker
pub struct MemoryClient {
    bus: Arc<dyn MessageBus>,
    correlator: Arc<Correlator>,
    recall_timeout: Duration,
}

impl MemoryClient {
    pub fn new(bus: Arc<dyn MessageBus>, cooldown: Duration, recall_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            bus,
            correlator: Arc::new(Correlator::with_cooldown(cooldown)),
            recall_timeout,
        })
    }

    /// Store a memory; fire-and-forget
    pub async fn store(&self, project_id: &str, content: &str) -> Result<(), RpcError> {
        self.bus
            .publish(
                subjects::MEMORY_STORE,
                json!({"project-id": project_id, "content": content}),
            )
            .await
            .map_err(|e| RpcError::Bus(e.to_string()))?;
        debug!(%project_id, "memory stored");
        Ok(())
    }

    /// Recall memories matching a query
    pub async fn recall(
        &self,
        project_id: &str,
        query: &str,
        top_k: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>, RpcError> {
        if self.correlator.is_unhealthy() {
            return Err(RpcError::Unhealthy);
        }

        let request_id = generate_correlation_id();
        let handle = self
            .correlator
            .register(&request_id)
            .map_err(|e| RpcError::Malformed(e.to_string()))?;

        let payload = json!({
            "project-id": project_id,
            "request-id": request_id,
            "query": query,
            "top-k": top_k,
        });
        if let Err(e) = self.bus.publish(subjects::MEMORY_RECALL, payload).await {
            self.correlator.unregister(&request_id);
            self.correlator.mark_failure();
            return Err(RpcError::Bus(e.to_string()));
        }

        let reply = match self.correlator.wait(handle, self.recall_timeout, cancel).await {
            Ok(reply) => reply,
            Err(e) => {
                self.correlator.mark_failure();
                return Err(e.into());
            }
        };

        if let Some(error) = reply.get("error").and_then(|v| v.as_str())
            && !error.is_empty()
        {
            return Err(RpcError::Worker(error.to_string()));
        }
        Ok(reply
            .get("memories")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Deliver recall results into the correlator
    pub async fn spawn_result_pump(self: &Arc<Self>) -> Result<(), RpcError> {
        let mut subscription = self
            .bus
            .subscribe(subjects::MEMORY_RECALL_RESULT)
            .await
            .map_err(|e| RpcError::Bus(e.to_string()))?;
        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(msg) = subscription.recv().await {
                if let Some(request_id) = msg.payload.get("request-id").and_then(|v| v.as_str()) {
                    client.correlator.deliver(request_id, msg.payload.clone());
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    #[tokio::test]
    async fn test_recall_round_trip() {
        let bus = Arc::new(MemoryBus::new());
        let client = MemoryClient::new(bus.clone(), Duration::from_secs(30), Duration::from_millis(200));
        client.spawn_result_pump().await.unwrap();

        let mut requests = bus.subscribe(subjects::MEMORY_RECALL).await.unwrap();
        let worker_bus = bus.clone();
        tokio::spawn(async move {
            let msg = requests.recv().await.unwrap();
            let request_id = msg.payload["request-id"].as_str().unwrap().to_string();
            worker_bus
                .publish(
                    subjects::MEMORY_RECALL_RESULT,
                    json!({"request-id": request_id, "memories": [{"content": "uses tokio"}]}),
                )
                .await
                .unwrap();
        });

        let cancel = CancellationToken::new();
        let memories = client.recall("proj-1", "runtime", 3, &cancel).await.unwrap();
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0]["content"], "uses tokio");
    }

    #[tokio::test]
    async fn test_store_publishes() {
        let bus = Arc::new(MemoryBus::new());
        let client = MemoryClient::new(bus.clone(), Duration::from_secs(30), Duration::from_millis(200));

        let mut stores = bus.subscribe(subjects::MEMORY_STORE).await.unwrap();
        client.store("proj-1", "project uses rust 2024").await.unwrap();

        let msg = stores.recv().await.unwrap();
        assert_eq!(msg.payload["project-id"], "proj-1");
    }
}
