//! Orchestrator core: plan creation and protocol advancement

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use eyre::{Context, Result, bail};
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::SharedContextStore;
use crate::domain::{
    DeliveryMode, ExecutionPlan, PlanProtocol, PlanStatus, RunStatus, Step, StepStatus, validate_step_graph,
};
use crate::events::{EventBus, ForgeEvent};
use crate::review::ReviewRouter;
use crate::run::{RunController, RunStartRequest};
use crate::state::StateManager;

/// Callback fired when a plan reaches a terminal status. Failures are
/// isolated: one failing callback never stops the rest of the chain.
pub type PlanCallback = Arc<dyn Fn(String, PlanStatus) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One step of a plan under construction
#[derive(Debug, Clone)]
pub struct CreateStepSpec {
    pub task_id: String,
    pub agent_id: String,
    pub profile: Option<String>,
    pub mode_id: Option<String>,
    pub delivery: DeliveryMode,

    /// Indices into the request's step list
    pub depends_on: Vec<usize>,

    /// Pre-marked as debated (used for debate sub-plans themselves)
    pub debated: bool,
}

impl CreateStepSpec {
    pub fn new(task_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            profile: None,
            mode_id: None,
            delivery: DeliveryMode::Auto,
            depends_on: Vec::new(),
            debated: false,
        }
    }

    pub fn with_deps(mut self, deps: Vec<usize>) -> Self {
        self.depends_on = deps;
        self
    }
}

/// Request to create a plan
#[derive(Debug, Clone)]
pub struct CreatePlanRequest {
    pub project_id: String,
    pub team_id: Option<String>,
    pub name: String,
    pub description: String,
    pub protocol: PlanProtocol,
    pub max_parallel: u32,
    pub steps: Vec<CreateStepSpec>,
}

/// Mapping from a debate sub-plan back to the step it fronts
pub(super) struct DebateLink {
    pub(super) parent_plan_id: String,
    pub(super) parent_step_id: String,
}

/// The plan orchestrator
pub struct Orchestrator {
    pub(super) state: StateManager,
    pub(super) events: EventBus,
    pub(super) config: Config,
    pub(super) runs: Arc<RunController>,
    pub(super) router: Option<Arc<ReviewRouter>>,
    pub(super) context: SharedContextStore,

    /// Serialises every advancement
    advance_lock: Mutex<()>,

    /// Completion callbacks in registration order
    callbacks: StdMutex<Vec<PlanCallback>>,

    /// debate plan id -> parent linkage
    pub(super) debates: Mutex<HashMap<String, DebateLink>>,

    /// Per-plan ping-pong round override (debate sub-plans)
    pub(super) round_overrides: Mutex<HashMap<String, u32>>,
}

impl Orchestrator {
    /// Build the orchestrator. The debate-resumption handler registers
    /// itself as the first completion callback.
    pub fn new(
        state: StateManager,
        events: EventBus,
        config: Config,
        runs: Arc<RunController>,
        router: Option<Arc<ReviewRouter>>,
        context: SharedContextStore,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            state,
            events,
            config,
            runs,
            router,
            context,
            advance_lock: Mutex::new(()),
            callbacks: StdMutex::new(Vec::new()),
            debates: Mutex::new(HashMap::new()),
            round_overrides: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&orchestrator);
        orchestrator.register_callback(Arc::new(move |plan_id, status| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(orchestrator) = weak.upgrade() {
                    orchestrator.handle_debate_completion(&plan_id, status).await?;
                }
                Ok(())
            })
        }));

        orchestrator
    }

    /// Register an on-plan-complete callback; order is registration order
    pub fn register_callback(&self, callback: PlanCallback) {
        self.callbacks.lock().expect("callback lock poisoned").push(callback);
    }

    /// The closure wired into the run controller's completion slot
    pub fn run_completion_callback(self: &Arc<Self>) -> crate::run::RunCompletionCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |run_id, status| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(orchestrator) = weak.upgrade() {
                    // Queue behind the advancement mutex rather than block
                    // the run controller's inbox
                    tokio::spawn(async move {
                        if let Err(e) = orchestrator.handle_run_complete(&run_id, status).await {
                            warn!(%run_id, error = %e, "run-completion handling failed");
                        }
                    });
                }
            })
        })
    }

    /// Validate and persist a plan with its steps
    pub async fn create_plan(&self, request: CreatePlanRequest) -> Result<ExecutionPlan> {
        if request.steps.is_empty() {
            bail!("plan must have at least one step");
        }
        if request.protocol == PlanProtocol::PingPong && request.steps.len() != 2 {
            bail!("ping-pong plans require exactly two steps");
        }
        if request.protocol == PlanProtocol::Consensus && request.steps.iter().any(|s| !s.depends_on.is_empty()) {
            bail!("consensus plans do not support step dependencies");
        }
        for (idx, spec) in request.steps.iter().enumerate() {
            for &dep in &spec.depends_on {
                if dep >= request.steps.len() {
                    bail!("step {} depends on unknown step index {}", idx, dep);
                }
                if dep == idx {
                    bail!("step {} depends on itself", idx);
                }
            }
        }

        let mut plan = ExecutionPlan::new(&request.project_id, &request.name, request.protocol);
        plan.team_id = request.team_id.clone();
        plan.description = request.description.clone();
        plan.max_parallel = request.max_parallel;

        // Two passes: create step rows, then remap index deps to ids
        let mut steps: Vec<Step> = Vec::with_capacity(request.steps.len());
        for (seq, spec) in request.steps.iter().enumerate() {
            let mut step = Step::new(&plan.id, &spec.task_id, &spec.agent_id, seq as u32);
            step.profile = spec.profile.clone();
            step.mode_id = spec.mode_id.clone();
            step.delivery = spec.delivery;
            step.debated = spec.debated;
            steps.push(step);
        }
        for (idx, spec) in request.steps.iter().enumerate() {
            let deps: Vec<String> = spec.depends_on.iter().map(|&d| steps[d].id.clone()).collect();
            steps[idx].depends_on = deps;
        }
        validate_step_graph(&steps).map_err(|cycle| eyre::eyre!("step dependency cycle: {:?}", cycle))?;

        self.state.create_plan(plan.clone()).await.context("plan create failed")?;
        for step in steps {
            self.state.create_step(step).await.context("step create failed")?;
        }

        self.events.emit(ForgeEvent::PlanStatus {
            plan_id: plan.id.clone(),
            status: PlanStatus::Pending,
        });
        info!(plan_id = %plan.id, protocol = %plan.protocol, "plan created");
        Ok(plan)
    }

    /// Move a pending plan to running and begin advancement
    pub async fn start_plan(&self, plan_id: &str) -> Result<()> {
        let finished = {
            let _guard = self.advance_lock.lock().await;
            let mut plan = self.state.get_plan_required(plan_id).await?;
            if plan.status != PlanStatus::Pending {
                bail!("plan {} is {} and cannot be started", plan_id, plan.status);
            }
            plan.set_status(PlanStatus::Running);
            self.state.update_plan(plan).await?;
            self.events.emit(ForgeEvent::PlanStatus {
                plan_id: plan_id.to_string(),
                status: PlanStatus::Running,
            });
            self.advance_inner(plan_id).await?
        };
        self.fire_callbacks(finished).await;
        Ok(())
    }

    /// Re-evaluate a plan after an external event
    pub async fn advance(&self, plan_id: &str) -> Result<()> {
        let finished = {
            let _guard = self.advance_lock.lock().await;
            self.advance_inner(plan_id).await?
        };
        self.fire_callbacks(finished).await;
        Ok(())
    }

    /// Cancel a plan: skip pending steps, cancel running runs
    pub async fn cancel_plan(&self, plan_id: &str) -> Result<()> {
        let finished = {
            let _guard = self.advance_lock.lock().await;
            let plan = self.state.get_plan_required(plan_id).await?;
            if plan.is_terminal() {
                return Ok(());
            }

            let steps = self.state.list_steps(plan_id).await?;
            for step in steps {
                match step.status {
                    StepStatus::Pending => {
                        let mut updated = step.clone();
                        updated.set_status(StepStatus::Skipped);
                        self.state.update_step(updated).await?;
                        self.emit_step(plan_id, &step.id, StepStatus::Skipped);
                    }
                    StepStatus::Running => {
                        if let Some(run_id) = &step.last_run_id
                            && let Err(e) = self.runs.cancel(run_id).await
                        {
                            warn!(%run_id, error = %e, "run cancel during plan cancel failed");
                        }
                        let mut updated = step.clone();
                        updated.set_status(StepStatus::Cancelled);
                        self.state.update_step(updated).await?;
                        self.emit_step(plan_id, &step.id, StepStatus::Cancelled);
                    }
                    _ => {}
                }
            }

            let mut finished = Vec::new();
            if let Some(entry) = self.finish_plan(plan_id, PlanStatus::Cancelled).await? {
                finished.push(entry);
            }
            finished
        };
        self.fire_callbacks(finished).await;
        Ok(())
    }

    /// Run-completion entry point: fold the run outcome into its step and
    /// advance the owning plan.
    pub async fn handle_run_complete(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let finished = {
            let _guard = self.advance_lock.lock().await;

            let Some(step) = self.state.find_step_by_run(run_id).await? else {
                debug!(%run_id, "completed run is not bound to a step");
                return Ok(());
            };
            let run = self.state.get_run_required(run_id).await?;

            let step_status = match status {
                RunStatus::Completed => StepStatus::Completed,
                RunStatus::Cancelled => StepStatus::Cancelled,
                _ => StepStatus::Failed,
            };
            let mut updated = step.clone();
            updated.set_status(step_status);
            if let Some(error) = &run.error {
                updated.set_error(error.clone());
            }
            self.state.update_step(updated).await?;
            self.emit_step(&step.plan_id, &step.id, step_status);

            // Successful team steps feed their output into shared context
            if step_status == StepStatus::Completed
                && let Some(team_id) = &run.team_id
                && let Some(output) = &run.output
                && !output.is_empty()
                && let Err(e) = self
                    .context
                    .add_item(team_id, &format!("step_output:{}", step.id), output, &run.agent_id)
                    .await
            {
                warn!(step_id = %step.id, error = %e, "shared-context auto-populate failed");
            }

            self.advance_inner(&step.plan_id).await?
        };
        self.fire_callbacks(finished).await;
        Ok(())
    }

    /// Protocol dispatch. Loops until the plan is settled, waiting on a
    /// run, or out of startable steps; returns every plan finished during
    /// this pass (the plan itself, or a debate sub-plan that failed fast).
    pub(super) fn advance_inner<'a>(
        &'a self,
        plan_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<(String, PlanStatus)>>> {
        Box::pin(async move {
            let mut finished = Vec::new();
            loop {
                let plan = self.state.get_plan_required(plan_id).await?;
                if plan.status != PlanStatus::Running {
                    return Ok(finished);
                }
                let steps = self.state.list_steps(plan_id).await?;

                match plan.protocol {
                    PlanProtocol::Sequential => {
                        if steps.iter().any(|s| s.status == StepStatus::Failed) {
                            self.push_finish(&mut finished, plan_id, PlanStatus::Failed).await?;
                            return Ok(finished);
                        }
                        // A step cancelled out from under a running plan
                        // settles the plan as cancelled, not failed
                        if steps.iter().any(|s| s.status == StepStatus::Cancelled) {
                            self.skip_pending(plan_id, &steps).await?;
                            self.push_finish(&mut finished, plan_id, PlanStatus::Cancelled).await?;
                            return Ok(finished);
                        }
                        if steps.iter().all(|s| s.is_terminal()) {
                            self.push_finish(&mut finished, plan_id, PlanStatus::Completed).await?;
                            return Ok(finished);
                        }
                        if steps.iter().any(|s| s.status == StepStatus::Running) {
                            return Ok(finished);
                        }
                        let completed = completed_ids(&steps);
                        let Some(next) = steps.iter().find(|s| s.is_ready(&completed)) else {
                            warn!(%plan_id, "sequential plan wedged on unsatisfiable dependencies");
                            self.skip_pending(plan_id, &steps).await?;
                            self.push_finish(&mut finished, plan_id, PlanStatus::Failed).await?;
                            return Ok(finished);
                        };
                        if self.start_step(&plan, next, &mut finished).await? {
                            return Ok(finished);
                        }
                        // Start failed; statuses changed, re-evaluate
                    }

                    PlanProtocol::Parallel => {
                        if steps.iter().all(|s| s.is_terminal()) {
                            let status = if steps.iter().any(|s| s.status == StepStatus::Failed) {
                                PlanStatus::Failed
                            } else if steps.iter().any(|s| s.status == StepStatus::Cancelled) {
                                PlanStatus::Cancelled
                            } else {
                                PlanStatus::Completed
                            };
                            self.push_finish(&mut finished, plan_id, status).await?;
                            return Ok(finished);
                        }
                        let max = if plan.max_parallel > 0 {
                            plan.max_parallel as usize
                        } else {
                            self.config.orchestrator.max_parallel as usize
                        };
                        let mut running = steps.iter().filter(|s| s.status == StepStatus::Running).count();
                        let completed = completed_ids(&steps);
                        let ready: Vec<&Step> = steps.iter().filter(|s| s.is_ready(&completed)).collect();

                        // A cancelled step drains the plan: let in-flight
                        // runs settle, start nothing new
                        if steps.iter().any(|s| s.status == StepStatus::Cancelled) {
                            if running == 0 {
                                self.skip_pending(plan_id, &steps).await?;
                                self.push_finish(&mut finished, plan_id, PlanStatus::Cancelled).await?;
                            }
                            return Ok(finished);
                        }

                        if running == 0 && ready.is_empty() {
                            warn!(%plan_id, "parallel plan wedged on unsatisfiable dependencies");
                            self.skip_pending(plan_id, &steps).await?;
                            self.push_finish(&mut finished, plan_id, PlanStatus::Failed).await?;
                            return Ok(finished);
                        }

                        let mut any_start_failed = false;
                        for step in ready {
                            if running >= max {
                                break;
                            }
                            if self.start_step(&plan, step, &mut finished).await? {
                                running += 1;
                            } else {
                                any_start_failed = true;
                            }
                        }
                        if !any_start_failed {
                            return Ok(finished);
                        }
                    }

                    PlanProtocol::PingPong => {
                        if steps.len() != 2 {
                            warn!(%plan_id, steps = steps.len(), "ping-pong plan without two steps");
                            self.push_finish(&mut finished, plan_id, PlanStatus::Failed).await?;
                            return Ok(finished);
                        }
                        if steps.iter().any(|s| s.status == StepStatus::Failed) {
                            self.push_finish(&mut finished, plan_id, PlanStatus::Failed).await?;
                            return Ok(finished);
                        }
                        if steps.iter().any(|s| s.status == StepStatus::Cancelled) {
                            self.push_finish(&mut finished, plan_id, PlanStatus::Cancelled).await?;
                            return Ok(finished);
                        }

                        let max = self.max_rounds(plan_id).await;

                        // A completed step's round advances; it returns to
                        // pending until its rounds are spent.
                        let mut bumped = false;
                        for step in &steps {
                            if step.status == StepStatus::Completed && step.round < max {
                                let mut updated = step.clone();
                                updated.round += 1;
                                if updated.round < max {
                                    updated.set_status(StepStatus::Pending);
                                } else {
                                    updated.set_status(StepStatus::Completed);
                                }
                                self.state.update_step(updated).await?;
                                bumped = true;
                            }
                        }
                        if bumped {
                            continue;
                        }

                        if steps[0].round >= max && steps[1].round >= max && steps.iter().all(|s| s.is_terminal()) {
                            self.push_finish(&mut finished, plan_id, PlanStatus::Completed).await?;
                            return Ok(finished);
                        }
                        if steps.iter().any(|s| s.status == StepStatus::Running) {
                            return Ok(finished);
                        }

                        // Step 0 plays even totals, step 1 odd
                        let total = steps[0].round + steps[1].round;
                        let idx = (total % 2) as usize;
                        let target = if steps[idx].status == StepStatus::Pending {
                            &steps[idx]
                        } else if steps[1 - idx].status == StepStatus::Pending {
                            &steps[1 - idx]
                        } else {
                            return Ok(finished);
                        };
                        if self.start_step(&plan, target, &mut finished).await? {
                            return Ok(finished);
                        }
                    }

                    PlanProtocol::Consensus => {
                        if steps.iter().all(|s| s.is_terminal()) {
                            let quorum = self.quorum(steps.len());
                            let completed = steps.iter().filter(|s| s.status == StepStatus::Completed).count();
                            let status = if completed >= quorum {
                                PlanStatus::Completed
                            } else {
                                PlanStatus::Failed
                            };
                            self.push_finish(&mut finished, plan_id, status).await?;
                            return Ok(finished);
                        }

                        // Dependencies are deliberately ignored: every
                        // pending step starts at once.
                        let pending: Vec<&Step> = steps.iter().filter(|s| s.status == StepStatus::Pending).collect();
                        if pending.is_empty() {
                            return Ok(finished);
                        }
                        let mut any_start_failed = false;
                        for step in pending {
                            if !self.start_step(&plan, step, &mut finished).await? {
                                any_start_failed = true;
                            }
                        }
                        if !any_start_failed {
                            return Ok(finished);
                        }
                    }
                }
            }
        })
    }

    /// Start one step: debate insertion first, then the run
    pub(super) async fn start_step(
        &self,
        plan: &ExecutionPlan,
        step: &Step,
        finished: &mut Vec<(String, PlanStatus)>,
    ) -> Result<bool> {
        if self.maybe_debate(plan, step, finished).await? {
            return Ok(true);
        }

        let request = RunStartRequest {
            task_id: step.task_id.clone(),
            agent_id: step.agent_id.clone(),
            project_id: plan.project_id.clone(),
            team_id: plan.team_id.clone(),
            profile: step.profile.clone(),
            exec_mode: self.config.run.exec_mode,
            mode_id: step.mode_id.clone(),
            workspace: None,
        };

        match self.runs.start(request).await {
            Ok(run) => {
                let mut updated = step.clone();
                updated.set_status(StepStatus::Running);
                updated.set_run(&run.id);
                self.state.update_step(updated).await?;
                self.emit_step(&plan.id, &step.id, StepStatus::Running);
                Ok(true)
            }
            Err(e) => {
                warn!(step_id = %step.id, error = %e, "step start failed");
                let mut updated = step.clone();
                updated.set_status(StepStatus::Failed);
                updated.set_error(e.to_string());
                self.state.update_step(updated).await?;
                self.emit_step(&plan.id, &step.id, StepStatus::Failed);
                Ok(false)
            }
        }
    }

    /// Terminal transition; monotonic, returns the entry for callbacks
    pub(super) async fn finish_plan(
        &self,
        plan_id: &str,
        status: PlanStatus,
    ) -> Result<Option<(String, PlanStatus)>> {
        let mut plan = self.state.get_plan_required(plan_id).await?;
        if !plan.set_status(status) {
            return Ok(None);
        }
        self.state.update_plan(plan).await?;
        self.events.emit(ForgeEvent::PlanStatus {
            plan_id: plan_id.to_string(),
            status,
        });
        info!(%plan_id, %status, "plan finished");
        Ok(Some((plan_id.to_string(), status)))
    }

    async fn push_finish(
        &self,
        finished: &mut Vec<(String, PlanStatus)>,
        plan_id: &str,
        status: PlanStatus,
    ) -> Result<()> {
        if let Some(entry) = self.finish_plan(plan_id, status).await? {
            finished.push(entry);
        }
        Ok(())
    }

    async fn skip_pending(&self, plan_id: &str, steps: &[Step]) -> Result<()> {
        for step in steps {
            if step.status == StepStatus::Pending {
                let mut updated = step.clone();
                updated.set_status(StepStatus::Skipped);
                self.state.update_step(updated).await?;
                self.emit_step(plan_id, &step.id, StepStatus::Skipped);
            }
        }
        Ok(())
    }

    /// Fire completion callbacks in registration order, outside the
    /// advancement lock. A failing callback never aborts the chain.
    pub(super) async fn fire_callbacks(&self, finished: Vec<(String, PlanStatus)>) {
        for (plan_id, status) in finished {
            let callbacks = self.callbacks.lock().expect("callback lock poisoned").clone();
            for callback in callbacks {
                if let Err(e) = callback(plan_id.clone(), status).await {
                    warn!(%plan_id, error = %e, "plan completion callback failed");
                }
            }
        }
    }

    pub(super) fn emit_step(&self, plan_id: &str, step_id: &str, status: StepStatus) {
        self.events.emit(ForgeEvent::PlanStepStatus {
            plan_id: plan_id.to_string(),
            step_id: step_id.to_string(),
            status,
        });
    }

    async fn max_rounds(&self, plan_id: &str) -> u32 {
        self.round_overrides
            .lock()
            .await
            .get(plan_id)
            .copied()
            .unwrap_or(self.config.orchestrator.ping_pong_max_rounds)
            .max(1)
    }

    fn quorum(&self, n: usize) -> usize {
        if self.config.orchestrator.consensus_quorum > 0 {
            self.config.orchestrator.consensus_quorum as usize
        } else {
            n / 2 + 1
        }
    }
}

fn completed_ids(steps: &[Step]) -> Vec<String> {
    steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .map(|s| s.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, MessageBus};
    use crate::checkpoint::{CheckpointLedger, GitPool};
    use crate::policy::PolicyEngine;
    use tokio_util::sync::CancellationToken;

    async fn orchestrator() -> Arc<Orchestrator> {
        let state = StateManager::spawn();
        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
        let events = EventBus::default();
        let config = Config::default();
        let context = SharedContextStore::new(state.clone(), bus.clone(), events.clone(), 0);
        let runs = RunController::new(
            state.clone(),
            bus,
            events.clone(),
            Arc::new(PolicyEngine::new(vec![])),
            Arc::new(CheckpointLedger::new(GitPool::default())),
            context.clone(),
            config.clone(),
            CancellationToken::new(),
        );
        Orchestrator::new(state, events, config, runs, None, context)
    }

    fn plan_request(protocol: PlanProtocol, steps: Vec<CreateStepSpec>) -> CreatePlanRequest {
        CreatePlanRequest {
            project_id: "proj-1".to_string(),
            team_id: None,
            name: "test plan".to_string(),
            description: String::new(),
            protocol,
            max_parallel: 0,
            steps,
        }
    }

    #[tokio::test]
    async fn test_create_plan_requires_steps() {
        let orchestrator = orchestrator().await;
        let err = orchestrator
            .create_plan(plan_request(PlanProtocol::Sequential, vec![]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[tokio::test]
    async fn test_ping_pong_requires_two_steps() {
        let orchestrator = orchestrator().await;
        let err = orchestrator
            .create_plan(plan_request(
                PlanProtocol::PingPong,
                vec![CreateStepSpec::new("t1", "a1")],
            ))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exactly two"));
    }

    #[tokio::test]
    async fn test_consensus_rejects_dependencies() {
        let orchestrator = orchestrator().await;
        let err = orchestrator
            .create_plan(plan_request(
                PlanProtocol::Consensus,
                vec![
                    CreateStepSpec::new("t1", "a1"),
                    CreateStepSpec::new("t2", "a2").with_deps(vec![0]),
                ],
            ))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("consensus"));
    }

    #[tokio::test]
    async fn test_dependency_indices_validated() {
        let orchestrator = orchestrator().await;
        let err = orchestrator
            .create_plan(plan_request(
                PlanProtocol::Sequential,
                vec![CreateStepSpec::new("t1", "a1").with_deps(vec![5])],
            ))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown step index"));

        let err = orchestrator
            .create_plan(plan_request(
                PlanProtocol::Sequential,
                vec![CreateStepSpec::new("t1", "a1").with_deps(vec![0])],
            ))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("itself"));
    }

    #[tokio::test]
    async fn test_create_plan_remaps_deps_to_ids() {
        let orchestrator = orchestrator().await;
        let plan = orchestrator
            .create_plan(plan_request(
                PlanProtocol::Sequential,
                vec![
                    CreateStepSpec::new("t1", "a1"),
                    CreateStepSpec::new("t2", "a1").with_deps(vec![0]),
                ],
            ))
            .await
            .unwrap();

        let steps = orchestrator.state.list_steps(&plan.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].depends_on, vec![steps[0].id.clone()]);
    }

    #[tokio::test]
    async fn test_start_requires_pending() {
        let orchestrator = orchestrator().await;
        let plan = orchestrator
            .create_plan(plan_request(
                PlanProtocol::Sequential,
                vec![CreateStepSpec::new("t-none", "a-none")],
            ))
            .await
            .unwrap();

        // Start moves to running even though the lone step fails to start
        // (unknown task); the plan settles failed.
        orchestrator.start_plan(&plan.id).await.unwrap();
        let plan = orchestrator.state.get_plan(&plan.id).await.unwrap().unwrap();
        assert_eq!(plan.status, PlanStatus::Failed);

        // A terminal plan cannot be re-started
        assert!(orchestrator.start_plan(&plan.id).await.is_err());
    }

    #[tokio::test]
    async fn test_terminal_plan_advance_is_noop() {
        let orchestrator = orchestrator().await;
        let plan = orchestrator
            .create_plan(plan_request(
                PlanProtocol::Sequential,
                vec![CreateStepSpec::new("t-none", "a-none")],
            ))
            .await
            .unwrap();
        orchestrator.start_plan(&plan.id).await.unwrap();

        // Advancing a settled plan changes nothing
        orchestrator.advance(&plan.id).await.unwrap();
        let after = orchestrator.state.get_plan(&plan.id).await.unwrap().unwrap();
        assert_eq!(after.status, PlanStatus::Failed);
    }

    #[tokio::test]
    async fn test_quorum_default_is_majority() {
        let orchestrator = orchestrator().await;
        assert_eq!(orchestrator.quorum(3), 2);
        assert_eq!(orchestrator.quorum(4), 3);
        assert_eq!(orchestrator.quorum(5), 3);
        assert_eq!(orchestrator.quorum(1), 1);
    }

    #[tokio::test]
    async fn test_callbacks_fire_in_order_and_isolate_failures() {
        let orchestrator = orchestrator().await;
        let order = Arc::new(StdMutex::new(Vec::new()));

        let first = order.clone();
        orchestrator.register_callback(Arc::new(move |_, _| {
            first.lock().unwrap().push("first");
            Box::pin(async { bail!("first callback explodes") })
        }));
        let second = order.clone();
        orchestrator.register_callback(Arc::new(move |_, _| {
            second.lock().unwrap().push("second");
            Box::pin(async { Ok(()) })
        }));

        orchestrator
            .fire_callbacks(vec![("plan-x".to_string(), PlanStatus::Completed)])
            .await;

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }
}
