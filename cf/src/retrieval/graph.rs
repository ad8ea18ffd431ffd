//! Graph client: symbol-graph builds and traversal search

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{MessageBus, subjects};
use crate::correlator::{Correlator, generate_correlation_id};
use crate::events::{EventBus, ForgeEvent};

use super::RpcError;
use super::client::{SearchHit, parse_hits};

/// Client for the symbol-graph worker; carries its own circuit breaker
pub struct GraphClient {
    bus: Arc<dyn MessageBus>,
    correlator: Arc<Correlator>,
    events: EventBus,
    search_timeout: Duration,
}

impl GraphClient {
    pub fn new(bus: Arc<dyn MessageBus>, events: EventBus, cooldown: Duration, search_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            bus,
            correlator: Arc::new(Correlator::with_cooldown(cooldown)),
            events,
            search_timeout,
        })
    }

    /// Whether the circuit breaker is open
    pub fn is_unhealthy(&self) -> bool {
        self.correlator.is_unhealthy()
    }

    /// Ask the worker to (re)build the project's symbol graph
    pub async fn request_build(&self, project_id: &str, workspace: &str) -> Result<(), RpcError> {
        self.bus
            .publish(
                subjects::GRAPH_BUILD_REQUEST,
                json!({"project-id": project_id, "workspace-path": workspace}),
            )
            .await
            .map_err(|e| RpcError::Bus(e.to_string()))?;
        self.events.emit(ForgeEvent::GraphStatus {
            project_id: project_id.to_string(),
            status: "building".to_string(),
        });
        info!(%project_id, "graph build requested");
        Ok(())
    }

    /// Traverse the symbol graph from seed symbols
    pub async fn search(
        &self,
        project_id: &str,
        seed_symbols: &[String],
        max_hops: u32,
        top_k: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>, RpcError> {
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
            "seed-symbols": seed_symbols,
            "max-hops": max_hops,
            "top-k": top_k,
        });
        if let Err(e) = self.bus.publish(subjects::GRAPH_SEARCH_REQUEST, payload).await {
            self.correlator.unregister(&request_id);
            self.correlator.mark_failure();
            return Err(RpcError::Bus(e.to_string()));
        }

        let reply = match self.correlator.wait(handle, self.search_timeout, cancel).await {
            Ok(reply) => reply,
            Err(e) => {
                self.correlator.mark_failure();
                return Err(e.into());
            }
        };

        parse_hits(&reply).inspect_err(|_| self.correlator.mark_failure())
    }

    /// Deliver worker results into the correlator
    pub async fn spawn_result_pump(self: &Arc<Self>) -> Result<(), RpcError> {
        for subject in [subjects::GRAPH_SEARCH_RESULT, subjects::GRAPH_BUILD_RESULT] {
            let mut subscription = self
                .bus
                .subscribe(subject)
                .await
                .map_err(|e| RpcError::Bus(e.to_string()))?;
            let client = Arc::clone(self);
            let subject = subject.to_string();
            tokio::spawn(async move {
                while let Some(msg) = subscription.recv().await {
                    if subject == subjects::GRAPH_BUILD_RESULT {
                        client.handle_build_result(&msg.payload);
                        continue;
                    }
                    if let Some(request_id) = msg.payload.get("request-id").and_then(|v| v.as_str()) {
                        client.correlator.deliver(request_id, msg.payload.clone());
                    }
                }
            });
        }
        Ok(())
    }

    fn handle_build_result(&self, payload: &Value) {
        let Some(project_id) = payload.get("project-id").and_then(|v| v.as_str()) else {
            warn!("graph build result without project-id dropped");
            return;
        };
        let status = match payload.get("error").and_then(|v| v.as_str()) {
            Some(error) if !error.is_empty() => {
                warn!(%project_id, %error, "graph build failed");
                "error"
            }
            _ => "ready",
        };
        self.events.emit(ForgeEvent::GraphStatus {
            project_id: project_id.to_string(),
            status: status.to_string(),
        });
    }
}
