//! Daemon wiring
//!
//! Constructs the store, bus, clients, controllers and orchestrator,
//! connects the completion-callback chain, and runs until shutdown.

use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{MemoryBus, MessageBus};
use crate::checkpoint::{CheckpointLedger, GitPool};
use crate::config::Config;
use crate::context::SharedContextStore;
use crate::evaluation::EvaluationDispatcher;
use crate::events::EventBus;
use crate::llm::{self, LlmClient};
use crate::orchestrator::Orchestrator;
use crate::planning::Decomposer;
use crate::policy::PolicyEngine;
use crate::retrieval::{GraphClient, MemoryClient, RetrievalClient};
use crate::review::{ReviewPolicyEngine, ReviewRouter};
use crate::run::RunController;
use crate::sandbox::SandboxManager;
use crate::state::StateManager;
use crate::team::PoolManager;

/// The assembled control plane
pub struct Daemon {
    pub config: Config,
    pub state: StateManager,
    pub bus: Arc<dyn MessageBus>,
    pub events: EventBus,
    pub policies: Arc<PolicyEngine>,
    pub checkpoints: Arc<CheckpointLedger>,
    pub context: SharedContextStore,
    pub runs: Arc<RunController>,
    pub orchestrator: Arc<Orchestrator>,
    pub pool: PoolManager,
    pub retrieval: Arc<RetrievalClient>,
    pub graph: Arc<GraphClient>,
    pub memory: Arc<MemoryClient>,
    pub evaluation: Arc<EvaluationDispatcher>,
    pub reviews: Arc<ReviewPolicyEngine>,
    pub sandboxes: Arc<SandboxManager>,

    /// Present when an LLM provider is configured and reachable
    pub decomposer: Option<Decomposer>,

    cancel: CancellationToken,
}

impl Daemon {
    /// Wire the control plane over an in-process bus
    pub fn new(config: Config) -> Result<Self> {
        Self::with_bus(config, Arc::new(MemoryBus::new()))
    }

    /// Wire the control plane over the given bus
    pub fn with_bus(config: Config, bus: Arc<dyn MessageBus>) -> Result<Self> {
        let cancel = CancellationToken::new();
        let state = StateManager::spawn();
        let events = EventBus::default();

        let policies = Arc::new(PolicyEngine::new(config.policies.clone()));
        let git_pool = GitPool::new(config.git.pool_size);
        let checkpoints = Arc::new(CheckpointLedger::new(git_pool));
        let context = SharedContextStore::new(
            state.clone(),
            bus.clone(),
            events.clone(),
            config.context.token_budget,
        );

        let runs = RunController::new(
            state.clone(),
            bus.clone(),
            events.clone(),
            policies.clone(),
            checkpoints.clone(),
            context.clone(),
            config.clone(),
            cancel.child_token(),
        );

        // The LLM is optional at boot: without it the decomposer and the
        // review router are disabled, everything else still runs.
        let llm_client: Option<Arc<dyn LlmClient>> = match llm::create_client(&config.llm) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(error = %e, "LLM client unavailable, decomposer and review router disabled");
                None
            }
        };
        let router = llm_client
            .as_ref()
            .map(|client| Arc::new(ReviewRouter::new(client.clone(), config.orchestrator.review_threshold)));

        let orchestrator = Orchestrator::new(
            state.clone(),
            events.clone(),
            config.clone(),
            runs.clone(),
            router,
            context.clone(),
        );

        let pool = PoolManager::new(state.clone(), context.clone(), events.clone(), config.team.max_team_size);

        let cooldown = Duration::from_secs(config.correlator.cooldown_secs);
        let search_timeout = Duration::from_secs(config.correlator.search_timeout_secs);
        let retrieval = RetrievalClient::new(
            bus.clone(),
            events.clone(),
            cooldown,
            search_timeout,
            config.retrieval.prefer_subagent,
        );
        let graph = GraphClient::new(bus.clone(), events.clone(), cooldown, search_timeout);
        let memory = MemoryClient::new(bus.clone(), cooldown, search_timeout);

        let evaluation = EvaluationDispatcher::new(state.clone(), bus.clone());
        orchestrator.register_callback(evaluation.callback());

        let reviews = ReviewPolicyEngine::new(state.clone(), orchestrator.clone(), events.clone());
        orchestrator.register_callback(reviews.callback());

        let sandboxes = Arc::new(SandboxManager::new(
            config.sandbox.runtime.clone(),
            config.sandbox.image.clone(),
            config.sandbox.limits,
            config.sandbox.network_mode.clone(),
        ));

        let decomposer = llm_client
            .map(|client| Decomposer::new(client, state.clone(), orchestrator.clone(), false));

        Ok(Self {
            config,
            state,
            bus,
            events,
            policies,
            checkpoints,
            context,
            runs,
            orchestrator,
            pool,
            retrieval,
            graph,
            memory,
            evaluation,
            reviews,
            sandboxes,
            decomposer,
            cancel,
        })
    }

    /// Subscribe the message pumps and start the background tickers
    pub async fn start(&self) -> Result<()> {
        // Run completion feeds plan advancement
        self.runs
            .set_completion_callback(self.orchestrator.run_completion_callback())
            .await;

        self.runs.spawn_message_pump().await.context("run pump failed")?;
        self.retrieval
            .spawn_result_pump()
            .await
            .map_err(|e| eyre::eyre!("retrieval pump failed: {}", e))?;
        self.graph
            .spawn_result_pump()
            .await
            .map_err(|e| eyre::eyre!("graph pump failed: {}", e))?;
        self.memory
            .spawn_result_pump()
            .await
            .map_err(|e| eyre::eyre!("memory pump failed: {}", e))?;

        tokio::spawn(self.reviews.clone().run_ticker(self.cancel.child_token()));

        info!("daemon started");
        Ok(())
    }

    /// Start and run until ctrl-c or shutdown
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
            }
            _ = self.cancel.cancelled() => {}
        }
        self.shutdown().await;
        Ok(())
    }

    /// Cancel every in-flight wait and stop the state actor
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.state.shutdown().await;
        info!("daemon stopped");
    }
}
