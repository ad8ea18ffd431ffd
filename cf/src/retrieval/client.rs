//! Retrieval client: index builds and hybrid search

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, subjects};
use crate::correlator::{Correlator, generate_correlation_id};
use crate::events::{EventBus, ForgeEvent};

use super::RpcError;

/// In-memory index state per project
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Building,
    Ready,
    Error,
}

impl std::fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Building => write!(f, "building"),
            Self::Ready => write!(f, "ready"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One search result from the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub file: String,

    #[serde(default)]
    pub score: f64,

    #[serde(default)]
    pub snippet: String,
}

/// Client for the retrieval worker
pub struct RetrievalClient {
    bus: Arc<dyn MessageBus>,
    correlator: Arc<Correlator>,
    events: EventBus,
    index_status: Mutex<HashMap<String, IndexStatus>>,
    search_timeout: Duration,

    /// When set, sub-agent search is the primary path and single-shot
    /// search the fallback; default is the inverse.
    prefer_subagent: bool,
}

impl RetrievalClient {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        events: EventBus,
        cooldown: Duration,
        search_timeout: Duration,
        prefer_subagent: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            correlator: Arc::new(Correlator::with_cooldown(cooldown)),
            events,
            index_status: Mutex::new(HashMap::new()),
            search_timeout,
            prefer_subagent,
        })
    }

    /// Whether the circuit breaker is open
    pub fn is_unhealthy(&self) -> bool {
        self.correlator.is_unhealthy()
    }

    /// Current index status for a project
    pub async fn index_status(&self, project_id: &str) -> Option<IndexStatus> {
        self.index_status.lock().await.get(project_id).copied()
    }

    /// Ask the indexing worker to (re)build the project index
    pub async fn request_index(&self, project_id: &str, workspace: &str, model: &str) -> Result<(), RpcError> {
        self.bus
            .publish(
                subjects::RETRIEVAL_INDEX_REQUEST,
                json!({
                    "project-id": project_id,
                    "workspace-path": workspace,
                    "model": model,
                }),
            )
            .await
            .map_err(|e| RpcError::Bus(e.to_string()))?;

        self.index_status
            .lock()
            .await
            .insert(project_id.to_string(), IndexStatus::Building);
        self.events.emit(ForgeEvent::RetrievalStatus {
            project_id: project_id.to_string(),
            status: IndexStatus::Building.to_string(),
        });
        info!(%project_id, "index build requested");
        Ok(())
    }

    /// Fold an index result from the worker into the status map
    pub async fn handle_index_result(&self, payload: &Value) {
        let Some(project_id) = payload.get("project-id").and_then(|v| v.as_str()) else {
            warn!("index result without project-id dropped");
            return;
        };
        let status = match payload.get("error").and_then(|v| v.as_str()) {
            Some(error) if !error.is_empty() => {
                warn!(%project_id, %error, "index build failed");
                IndexStatus::Error
            }
            _ => IndexStatus::Ready,
        };
        self.index_status.lock().await.insert(project_id.to_string(), status);
        self.events.emit(ForgeEvent::RetrievalStatus {
            project_id: project_id.to_string(),
            status: status.to_string(),
        });
    }

    /// Hybrid search with primary/fallback between the single-shot and
    /// sub-agent paths.
    pub async fn search(
        &self,
        project_id: &str,
        query: &str,
        top_k: u32,
        bm25_weight: f64,
        semantic_weight: f64,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>, RpcError> {
        // Consult the breaker once up front; a primary-leg timeout must
        // not short-circuit its own fallback.
        if self.correlator.is_unhealthy() {
            return Err(RpcError::Unhealthy);
        }

        let single_payload = json!({
            "project-id": project_id,
            "query": query,
            "top-k": top_k,
            "bm25-weight": bm25_weight,
            "semantic-weight": semantic_weight,
        });
        let subagent_payload = json!({
            "project-id": project_id,
            "query": query,
            "top-k": top_k,
            "max-queries": 4,
            "rerank": true,
        });

        if self.prefer_subagent {
            match self
                .search_on(subjects::SUBAGENT_SEARCH_REQUEST, subagent_payload, cancel)
                .await
            {
                Err(RpcError::Timeout) => {
                    debug!(%project_id, "sub-agent search timed out, falling back to single-shot");
                    self.search_on(subjects::RETRIEVAL_SEARCH_REQUEST, single_payload, cancel).await
                }
                other => other,
            }
        } else {
            match self
                .search_on(subjects::RETRIEVAL_SEARCH_REQUEST, single_payload, cancel)
                .await
            {
                Err(RpcError::Timeout) => {
                    debug!(%project_id, "single-shot search timed out, falling back to sub-agent");
                    self.search_on(subjects::SUBAGENT_SEARCH_REQUEST, subagent_payload, cancel).await
                }
                other => other,
            }
        }
    }

    async fn search_on(
        &self,
        subject: &str,
        mut payload: Value,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>, RpcError> {
        let request_id = generate_correlation_id();
        payload["request-id"] = json!(request_id);

        let handle = self
            .correlator
            .register(&request_id)
            .map_err(|e| RpcError::Malformed(e.to_string()))?;

        if let Err(e) = self.bus.publish(subject, payload).await {
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

    /// Deliver worker results into the correlator; one task per subject
    pub async fn spawn_result_pump(self: &Arc<Self>) -> Result<(), RpcError> {
        for subject in [
            subjects::RETRIEVAL_SEARCH_RESULT,
            subjects::SUBAGENT_SEARCH_RESULT,
            subjects::RETRIEVAL_INDEX_RESULT,
        ] {
            let mut subscription = self
                .bus
                .subscribe(subject)
                .await
                .map_err(|e| RpcError::Bus(e.to_string()))?;
            let client = Arc::clone(self);
            let subject = subject.to_string();
            tokio::spawn(async move {
                while let Some(msg) = subscription.recv().await {
                    if subject == subjects::RETRIEVAL_INDEX_RESULT {
                        client.handle_index_result(&msg.payload).await;
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
}

/// Shared result-shape parsing for search-style replies
pub(super) fn parse_hits(reply: &Value) -> Result<Vec<SearchHit>, RpcError> {
    if let Some(error) = reply.get("error").and_then(|v| v.as_str())
        && !error.is_empty()
    {
        return Err(RpcError::Worker(error.to_string()));
    }
    let hits = reply.get("hits").cloned().unwrap_or_else(|| json!([]));
    serde_json::from_value(hits).map_err(|e| RpcError::Malformed(e.to_string()))
}
