//! StateManager - actor that owns the store
//!
//! Commands are processed one at a time, which makes every
//! read-modify-write below atomic with respect to every other caller.

use forgestore::{Filter, Store};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::domain::{
    Agent, AgentStatus, ExecutionPlan, ReviewPolicy, ReviewRecord, Run, RunEvent, RunStatus, SharedContext, Step,
    Task, TaskStatus, Team,
};

use super::messages::{StateCommand, StateError, StateResponse};

/// Handle to send commands to the StateManager actor
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
}

macro_rules! send_command {
    ($self:expr, $variant:ident { $($field:ident : $value:expr),* $(,)? }) => {{
        let (reply_tx, reply_rx) = oneshot::channel();
        $self
            .tx
            .send(StateCommand::$variant { $($field: $value,)* reply: reply_tx })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }};
}

impl StateManager {
    /// Spawn the actor over a fresh in-memory store
    pub fn spawn() -> Self {
        Self::spawn_with_store(Store::new())
    }

    /// Spawn the actor over an existing store
    pub fn spawn_with_store(store: Store) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, rx));
        info!("StateManager spawned");
        Self { tx }
    }

    /// Request shutdown of the actor
    pub async fn shutdown(&self) {
        let _ = self.tx.send(StateCommand::Shutdown).await;
    }

    // === Plan operations ===

    pub async fn create_plan(&self, plan: ExecutionPlan) -> StateResponse<String> {
        debug!(plan_id = %plan.id, "create_plan");
        send_command!(self, CreatePlan { plan: plan })
    }

    pub async fn get_plan(&self, id: &str) -> StateResponse<Option<ExecutionPlan>> {
        send_command!(self, GetPlan { id: id.to_string() })
    }

    pub async fn get_plan_required(&self, id: &str) -> StateResponse<ExecutionPlan> {
        self.get_plan(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("plan {}", id)))
    }

    pub async fn update_plan(&self, plan: ExecutionPlan) -> StateResponse<()> {
        debug!(plan_id = %plan.id, status = %plan.status, "update_plan");
        send_command!(self, UpdatePlan { plan: plan })
    }

    pub async fn list_plans(
        &self,
        project_filter: Option<String>,
        status_filter: Option<String>,
    ) -> StateResponse<Vec<ExecutionPlan>> {
        send_command!(self, ListPlans {
            project_filter: project_filter,
            status_filter: status_filter,
        })
    }

    // === Step operations ===

    pub async fn create_step(&self, step: Step) -> StateResponse<String> {
        debug!(step_id = %step.id, plan_id = %step.plan_id, "create_step");
        send_command!(self, CreateStep { step: step })
    }

    pub async fn get_step(&self, id: &str) -> StateResponse<Option<Step>> {
        send_command!(self, GetStep { id: id.to_string() })
    }

    pub async fn get_step_required(&self, id: &str) -> StateResponse<Step> {
        self.get_step(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("step {}", id)))
    }

    pub async fn update_step(&self, step: Step) -> StateResponse<()> {
        debug!(step_id = %step.id, status = %step.status, "update_step");
        send_command!(self, UpdateStep { step: step })
    }

    /// Steps of a plan in sequence order
    pub async fn list_steps(&self, plan_id: &str) -> StateResponse<Vec<Step>> {
        send_command!(self, ListSteps { plan_id: plan_id.to_string() })
    }

    pub async fn find_step_by_run(&self, run_id: &str) -> StateResponse<Option<Step>> {
        send_command!(self, FindStepByRun { run_id: run_id.to_string() })
    }

    // === Run operations ===

    pub async fn create_run(&self, run: Run) -> StateResponse<String> {
        debug!(run_id = %run.id, task_id = %run.task_id, "create_run");
        send_command!(self, CreateRun { run: run })
    }

    pub async fn get_run(&self, id: &str) -> StateResponse<Option<Run>> {
        send_command!(self, GetRun { id: id.to_string() })
    }

    pub async fn get_run_required(&self, id: &str) -> StateResponse<Run> {
        self.get_run(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("run {}", id)))
    }

    pub async fn update_run(&self, run: Run) -> StateResponse<()> {
        send_command!(self, UpdateRun { run: run })
    }

    /// Atomically increment the run's step count; returns the new count
    pub async fn increment_run_steps(&self, run_id: &str) -> StateResponse<u32> {
        send_command!(self, IncrementRunSteps { run_id: run_id.to_string() })
    }

    /// Atomically add to the run's cost; returns the new total
    pub async fn add_run_cost(&self, run_id: &str, delta_usd: f64) -> StateResponse<f64> {
        send_command!(self, AddRunCost {
            run_id: run_id.to_string(),
            delta_usd: delta_usd,
        })
    }

    /// Settle a run exactly once; None when already terminal
    pub async fn settle_run(
        &self,
        run_id: &str,
        status: RunStatus,
        output: Option<String>,
        error: Option<String>,
        step_count: Option<u32>,
        cost_usd: Option<f64>,
    ) -> StateResponse<Option<Run>> {
        debug!(%run_id, %status, "settle_run");
        send_command!(self, SettleRun {
            run_id: run_id.to_string(),
            status: status,
            output: output,
            error: error,
            step_count: step_count,
            cost_usd: cost_usd,
        })
    }

    // === Task operations ===

    pub async fn create_task(&self, task: Task) -> StateResponse<String> {
        send_command!(self, CreateTask { task: task })
    }

    pub async fn get_task(&self, id: &str) -> StateResponse<Option<Task>> {
        send_command!(self, GetTask { id: id.to_string() })
    }

    pub async fn get_task_required(&self, id: &str) -> StateResponse<Task> {
        self.get_task(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("task {}", id)))
    }

    pub async fn set_task_status(&self, id: &str, status: TaskStatus) -> StateResponse<()> {
        send_command!(self, SetTaskStatus {
            id: id.to_string(),
            status: status,
        })
    }

    pub async fn list_tasks(&self, project_id: &str) -> StateResponse<Vec<Task>> {
        send_command!(self, ListTasks { project_id: project_id.to_string() })
    }

    // === Agent operations ===

    pub async fn create_agent(&self, agent: Agent) -> StateResponse<String> {
        send_command!(self, CreateAgent { agent: agent })
    }

    pub async fn get_agent(&self, id: &str) -> StateResponse<Option<Agent>> {
        send_command!(self, GetAgent { id: id.to_string() })
    }

    pub async fn get_agent_required(&self, id: &str) -> StateResponse<Agent> {
        self.get_agent(id)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("agent {}", id)))
    }

    pub async fn set_agent_status(&self, id: &str, status: AgentStatus) -> StateResponse<()> {
        debug!(agent_id = %id, %status, "set_agent_status");
        send_command!(self, SetAgentStatus {
            id: id.to_string(),
            status: status,
        })
    }

    pub async fn list_agents(&self, project_id: &str) -> StateResponse<Vec<Agent>> {
        send_command!(self, ListAgents { project_id: project_id.to_string() })
    }

    // === Team operations ===

    pub async fn create_team(&self, team: Team) -> StateResponse<String> {
        send_command!(self, CreateTeam { team: team })
    }

    pub async fn get_team(&self, id: &str) -> StateResponse<Option<Team>> {
        send_command!(self, GetTeam { id: id.to_string() })
    }

    pub async fn update_team(&self, team: Team) -> StateResponse<()> {
        send_command!(self, UpdateTeam { team: team })
    }

    // === Shared-context operations ===

    pub async fn create_context(&self, context: SharedContext) -> StateResponse<String> {
        send_command!(self, CreateContext { context: context })
    }

    pub async fn get_context_for_team(&self, team_id: &str) -> StateResponse<Option<SharedContext>> {
        send_command!(self, GetContextForTeam { team_id: team_id.to_string() })
    }

    /// Append an item to the team's context; returns the new version
    pub async fn append_context_item(
        &self,
        team_id: &str,
        key: &str,
        value: &str,
        author: &str,
        token_budget: u64,
    ) -> StateResponse<u64> {
        send_command!(self, AppendContextItem {
            team_id: team_id.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            author: author.to_string(),
            token_budget: token_budget,
        })
    }

    // === Run-event operations ===

    pub async fn append_run_event(&self, event: RunEvent) -> StateResponse<()> {
        send_command!(self, AppendRunEvent { event: event })
    }

    pub async fn list_run_events(&self, run_id: &str) -> StateResponse<Vec<RunEvent>> {
        send_command!(self, ListRunEvents { run_id: run_id.to_string() })
    }

    // === Review operations ===

    pub async fn create_review_policy(&self, policy: ReviewPolicy) -> StateResponse<String> {
        send_command!(self, CreateReviewPolicy { policy: policy })
    }

    pub async fn update_review_policy(&self, policy: ReviewPolicy) -> StateResponse<()> {
        send_command!(self, UpdateReviewPolicy { policy: policy })
    }

    pub async fn list_review_policies(&self, project_filter: Option<String>) -> StateResponse<Vec<ReviewPolicy>> {
        send_command!(self, ListReviewPolicies { project_filter: project_filter })
    }

    /// Bump the policy's commit counter; true when the threshold fired
    pub async fn bump_commit_counter(&self, policy_id: &str, commits: u32) -> StateResponse<bool> {
        send_command!(self, BumpCommitCounter {
            policy_id: policy_id.to_string(),
            commits: commits,
        })
    }

    pub async fn create_review_record(&self, record: ReviewRecord) -> StateResponse<String> {
        send_command!(self, CreateReviewRecord { record: record })
    }

    pub async fn update_review_record(&self, record: ReviewRecord) -> StateResponse<()> {
        send_command!(self, UpdateReviewRecord { record: record })
    }

    pub async fn find_review_by_plan(&self, plan_id: &str) -> StateResponse<Option<ReviewRecord>> {
        send_command!(self, FindReviewByPlan { plan_id: plan_id.to_string() })
    }
}

/// The actor task: owns the store, processes commands sequentially
async fn actor_loop(mut store: Store, mut rx: mpsc::Receiver<StateCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            StateCommand::CreatePlan { plan, reply } => {
                let id = plan.id.clone();
                let _ = reply.send(store.create(&plan).map(|_| id).map_err(Into::into));
            }
            StateCommand::GetPlan { id, reply } => {
                let _ = reply.send(store.get::<ExecutionPlan>(&id).map_err(Into::into));
            }
            StateCommand::UpdatePlan { plan, reply } => {
                let _ = reply.send(store.update(&plan).map_err(Into::into));
            }
            StateCommand::ListPlans {
                project_filter,
                status_filter,
                reply,
            } => {
                let mut filters = Vec::new();
                if let Some(project) = project_filter {
                    filters.push(Filter::eq("project", project));
                }
                if let Some(status) = status_filter {
                    filters.push(Filter::eq("status", status));
                }
                let _ = reply.send(store.find::<ExecutionPlan>(&filters).map_err(Into::into));
            }

            StateCommand::CreateStep { step, reply } => {
                let id = step.id.clone();
                let _ = reply.send(store.create(&step).map(|_| id).map_err(Into::into));
            }
            StateCommand::GetStep { id, reply } => {
                let _ = reply.send(store.get::<Step>(&id).map_err(Into::into));
            }
            StateCommand::UpdateStep { step, reply } => {
                let _ = reply.send(store.update(&step).map_err(Into::into));
            }
            StateCommand::ListSteps { plan_id, reply } => {
                let result = store.find::<Step>(&[Filter::eq("plan", plan_id)]).map(|mut steps| {
                    steps.sort_by_key(|s| s.seq);
                    steps
                });
                let _ = reply.send(result.map_err(Into::into));
            }
            StateCommand::FindStepByRun { run_id, reply } => {
                let result = store
                    .find::<Step>(&[Filter::eq("last_run", run_id)])
                    .map(|steps| steps.into_iter().next());
                let _ = reply.send(result.map_err(Into::into));
            }

            StateCommand::CreateRun { run, reply } => {
                let id = run.id.clone();
                let _ = reply.send(store.create(&run).map(|_| id).map_err(Into::into));
            }
            StateCommand::GetRun { id, reply } => {
                let _ = reply.send(store.get::<Run>(&id).map_err(Into::into));
            }
            StateCommand::UpdateRun { run, reply } => {
                let _ = reply.send(store.update(&run).map_err(Into::into));
            }
            StateCommand::IncrementRunSteps { run_id, reply } => {
                let _ = reply.send(increment_run_steps(&mut store, &run_id));
            }
            StateCommand::AddRunCost { run_id, delta_usd, reply } => {
                let _ = reply.send(add_run_cost(&mut store, &run_id, delta_usd));
            }
            StateCommand::SettleRun {
                run_id,
                status,
                output,
                error,
                step_count,
                cost_usd,
                reply,
            } => {
                let _ = reply.send(settle_run(&mut store, &run_id, status, output, error, step_count, cost_usd));
            }

            StateCommand::CreateTask { task, reply } => {
                let id = task.id.clone();
                let _ = reply.send(store.create(&task).map(|_| id).map_err(Into::into));
            }
            StateCommand::GetTask { id, reply } => {
                let _ = reply.send(store.get::<Task>(&id).map_err(Into::into));
            }
            StateCommand::SetTaskStatus { id, status, reply } => {
                let result = match store.get::<Task>(&id) {
                    Ok(Some(mut task)) => {
                        task.set_status(status);
                        store.update(&task).map_err(Into::into)
                    }
                    Ok(None) => Err(StateError::NotFound(format!("task {}", id))),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            StateCommand::ListTasks { project_id, reply } => {
                let _ = reply.send(store.find::<Task>(&[Filter::eq("project", project_id)]).map_err(Into::into));
            }

            StateCommand::CreateAgent { agent, reply } => {
                let id = agent.id.clone();
                let _ = reply.send(store.create(&agent).map(|_| id).map_err(Into::into));
            }
            StateCommand::GetAgent { id, reply } => {
                let _ = reply.send(store.get::<Agent>(&id).map_err(Into::into));
            }
            StateCommand::SetAgentStatus { id, status, reply } => {
                let result = match store.get::<Agent>(&id) {
                    Ok(Some(mut agent)) => {
                        agent.set_status(status);
                        store.update(&agent).map_err(Into::into)
                    }
                    Ok(None) => Err(StateError::NotFound(format!("agent {}", id))),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            StateCommand::ListAgents { project_id, reply } => {
                let _ = reply.send(store.find::<Agent>(&[Filter::eq("project", project_id)]).map_err(Into::into));
            }

            StateCommand::CreateTeam { team, reply } => {
                let id = team.id.clone();
                let _ = reply.send(store.create(&team).map(|_| id).map_err(Into::into));
            }
            StateCommand::GetTeam { id, reply } => {
                let _ = reply.send(store.get::<Team>(&id).map_err(Into::into));
            }
            StateCommand::UpdateTeam { team, reply } => {
                let _ = reply.send(store.update(&team).map_err(Into::into));
            }

            StateCommand::CreateContext { context, reply } => {
                let id = context.id.clone();
                let _ = reply.send(store.create(&context).map(|_| id).map_err(Into::into));
            }
            StateCommand::GetContextForTeam { team_id, reply } => {
                let result = store
                    .find::<SharedContext>(&[Filter::eq("team", team_id)])
                    .map(|contexts| contexts.into_iter().next());
                let _ = reply.send(result.map_err(Into::into));
            }
            StateCommand::AppendContextItem {
                team_id,
                key,
                value,
                author,
                token_budget,
                reply,
            } => {
                let _ = reply.send(append_context_item(&mut store, &team_id, &key, &value, &author, token_budget));
            }

            StateCommand::AppendRunEvent { event, reply } => {
                let _ = reply.send(store.create(&event).map(|_| ()).map_err(Into::into));
            }
            StateCommand::ListRunEvents { run_id, reply } => {
                let result = store.find::<RunEvent>(&[Filter::eq("run", run_id)]).map(|mut events| {
                    events.sort_by_key(|e| e.seq);
                    events
                });
                let _ = reply.send(result.map_err(Into::into));
            }

            StateCommand::CreateReviewPolicy { policy, reply } => {
                let id = policy.id.clone();
                let _ = reply.send(store.create(&policy).map(|_| id).map_err(Into::into));
            }
            StateCommand::UpdateReviewPolicy { policy, reply } => {
                let _ = reply.send(store.update(&policy).map_err(Into::into));
            }
            StateCommand::ListReviewPolicies { project_filter, reply } => {
                let mut filters = vec![Filter::eq("enabled", true)];
                if let Some(project) = project_filter {
                    filters.push(Filter::eq("project", project));
                }
                let _ = reply.send(store.find::<ReviewPolicy>(&filters).map_err(Into::into));
            }
            StateCommand::BumpCommitCounter { policy_id, commits, reply } => {
                let _ = reply.send(bump_commit_counter(&mut store, &policy_id, commits));
            }
            StateCommand::CreateReviewRecord { record, reply } => {
                let id = record.id.clone();
                let _ = reply.send(store.create(&record).map(|_| id).map_err(Into::into));
            }
            StateCommand::UpdateReviewRecord { record, reply } => {
                let _ = reply.send(store.update(&record).map_err(Into::into));
            }
            StateCommand::FindReviewByPlan { plan_id, reply } => {
                let result = store
                    .find::<ReviewRecord>(&[Filter::eq("plan", plan_id)])
                    .map(|records| records.into_iter().next());
                let _ = reply.send(result.map_err(Into::into));
            }

            StateCommand::Shutdown => {
                info!("StateManager shutting down");
                break;
            }
        }
    }
}

fn increment_run_steps(store: &mut Store, run_id: &str) -> StateResponse<u32> {
    let mut run = store
        .get::<Run>(run_id)?
        .ok_or_else(|| StateError::NotFound(format!("run {}", run_id)))?;
    run.step_count += 1;
    run.updated_at = forgestore::now_ms();
    let count = run.step_count;
    store.update(&run)?;
    Ok(count)
}

fn add_run_cost(store: &mut Store, run_id: &str, delta_usd: f64) -> StateResponse<f64> {
    let mut run = store
        .get::<Run>(run_id)?
        .ok_or_else(|| StateError::NotFound(format!("run {}", run_id)))?;
    // Cost is monotonic: negative deltas are dropped
    if delta_usd > 0.0 {
        run.cost_usd += delta_usd;
        run.updated_at = forgestore::now_ms();
        store.update(&run)?;
    } else if delta_usd < 0.0 {
        warn!(%run_id, delta_usd, "add_run_cost: negative delta ignored");
    }
    Ok(run.cost_usd)
}

fn settle_run(
    store: &mut Store,
    run_id: &str,
    status: RunStatus,
    output: Option<String>,
    error: Option<String>,
    step_count: Option<u32>,
    cost_usd: Option<f64>,
) -> StateResponse<Option<Run>> {
    let mut run = store
        .get::<Run>(run_id)?
        .ok_or_else(|| StateError::NotFound(format!("run {}", run_id)))?;

    if !run.settle(status, output, error) {
        return Ok(None);
    }
    // Worker-reported totals only ever raise the monotonic counters
    if let Some(steps) = step_count {
        run.step_count = run.step_count.max(steps);
    }
    if let Some(cost) = cost_usd {
        run.cost_usd = run.cost_usd.max(cost);
    }
    store.update(&run)?;
    Ok(Some(run))
}

fn append_context_item(
    store: &mut Store,
    team_id: &str,
    key: &str,
    value: &str,
    author: &str,
    token_budget: u64,
) -> StateResponse<u64> {
    let mut context = store
        .find::<SharedContext>(&[Filter::eq("team", team_id)])?
        .into_iter()
        .next()
        .ok_or_else(|| StateError::NotFound(format!("shared context for team {}", team_id)))?;

    let version = context.append(key, value, author);
    if token_budget > 0 {
        let evicted = context.evict_to_budget(token_budget);
        if evicted > 0 {
            debug!(%team_id, evicted, "append_context_item: evicted oldest items");
        }
    }
    store.update(&context)?;
    Ok(version)
}

fn bump_commit_counter(store: &mut Store, policy_id: &str, commits: u32) -> StateResponse<bool> {
    let mut policy = store
        .get::<ReviewPolicy>(policy_id)?
        .ok_or_else(|| StateError::NotFound(format!("review policy {}", policy_id)))?;

    policy.commit_counter += commits;
    let fired = policy.threshold > 0 && policy.commit_counter >= policy.threshold;
    if fired {
        policy.commit_counter = 0;
    }
    policy.touch();
    store.update(&policy)?;
    Ok(fired)
}
