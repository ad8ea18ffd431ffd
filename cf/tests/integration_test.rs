//! End-to-end scenarios for the control plane
//!
//! A scripted worker stands in for the remote execution side of the bus:
//! it answers `run.start` with tool-call traffic and `run.complete`
//! messages, which drives plan advancement exactly as production workers
//! would.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use codeforge::bus::{MemoryBus, MessageBus, subjects};
use codeforge::checkpoint::{CheckpointLedger, GitPool};
use codeforge::config::Config;
use codeforge::context::SharedContextStore;
use codeforge::domain::{
    Agent, AgentStatus, ExecMode, PlanProtocol, PlanStatus, StepStatus, Task, TeamRole,
};
use codeforge::events::EventBus;
use codeforge::llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError, TokenUsage};
use codeforge::orchestrator::{CreatePlanRequest, CreateStepSpec, Orchestrator};
use codeforge::policy::{
    PermissionDecision, PermissionMode, PermissionRule, PolicyEngine, PolicyProfile, ToolCall,
};
use codeforge::review::ReviewRouter;
use codeforge::run::{RunController, RunStartRequest};
use codeforge::state::StateManager;
use codeforge::team::{CreateTeamRequest, PoolManager, TeamMemberSpec};

/// Assembled control plane over an in-process bus
struct Harness {
    state: StateManager,
    bus: Arc<MemoryBus>,
    runs: Arc<RunController>,
    orchestrator: Arc<Orchestrator>,
    pool: PoolManager,
    context: SharedContextStore,
}

struct CannedLlm {
    response: String,
}

#[async_trait]
impl LlmClient for CannedLlm {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Ok(CompletionResponse {
            content: self.response.clone(),
            usage: TokenUsage::default(),
        })
    }
}

async fn harness(config: Config, profiles: Vec<PolicyProfile>, router: Option<Arc<ReviewRouter>>) -> Harness {
    let state = StateManager::spawn();
    let bus = Arc::new(MemoryBus::new());
    let events = EventBus::default();
    let policies = Arc::new(PolicyEngine::new(profiles));
    let checkpoints = Arc::new(CheckpointLedger::new(GitPool::default()));
    let context = SharedContextStore::new(state.clone(), bus.clone(), events.clone(), 0);

    let runs = RunController::new(
        state.clone(),
        bus.clone() as Arc<dyn MessageBus>,
        events.clone(),
        policies,
        checkpoints,
        context.clone(),
        config.clone(),
        CancellationToken::new(),
    );
    runs.spawn_message_pump().await.unwrap();

    let orchestrator = Orchestrator::new(
        state.clone(),
        events.clone(),
        config.clone(),
        runs.clone(),
        router,
        context.clone(),
    );
    runs.set_completion_callback(orchestrator.run_completion_callback()).await;

    let pool = PoolManager::new(state.clone(), context.clone(), events.clone(), 5);

    Harness {
        state,
        bus,
        runs,
        orchestrator,
        pool,
        context,
    }
}

/// Scripted worker: completes every run after a short delay. Tasks in
/// `fail_tasks` complete with a failed status. The shared log records
/// start/complete ordering; the gauge tracks concurrency.
struct WorkerScript {
    delay: Duration,
    fail_tasks: HashSet<String>,
    log: Arc<std::sync::Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl WorkerScript {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            fail_tasks: HashSet::new(),
            log: Arc::new(std::sync::Mutex::new(Vec::new())),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn failing(mut self, task_ids: &[String]) -> Self {
        self.fail_tasks = task_ids.iter().cloned().collect();
        self
    }

    async fn spawn(self, bus: Arc<MemoryBus>) -> (Arc<std::sync::Mutex<Vec<String>>>, Arc<AtomicUsize>) {
        let mut starts = bus.subscribe(subjects::RUN_START).await.unwrap();
        let log = self.log.clone();
        let peak = self.peak.clone();

        tokio::spawn(async move {
            while let Some(msg) = starts.recv().await {
                let run_id = msg.payload["run-id"].as_str().unwrap().to_string();
                let task_id = msg.payload["task-id"].as_str().unwrap().to_string();
                let agent_id = msg.payload["agent-id"].as_str().unwrap().to_string();
                let fail = self.fail_tasks.contains(&task_id);

                self.log.lock().unwrap().push(format!("start:{}", task_id));
                let active = self.active.clone();
                let peak = self.peak.clone();
                let log = self.log.clone();
                let bus = bus.clone();
                let delay = self.delay;

                tokio::spawn(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    active.fetch_sub(1, Ordering::SeqCst);

                    log.lock().unwrap().push(format!("complete:{}", task_id));
                    let (status, output, error) = if fail {
                        ("failed", None, Some("scripted failure"))
                    } else {
                        ("completed", Some(format!("done by {}", agent_id)), None)
                    };
                    bus.publish(
                        subjects::RUN_COMPLETE,
                        json!({
                            "run-id": run_id,
                            "status": status,
                            "output": output,
                            "error": error,
                            "step-count": 1,
                            "cost-usd": 0.01,
                        }),
                    )
                    .await
                    .unwrap();
                });
            }
        });

        (log, peak)
    }
}

async fn seed_agents(h: &Harness, names: &[&str]) -> Vec<String> {
    let mut ids = Vec::new();
    for name in names {
        let agent = Agent::new("proj-1", *name, "claude");
        ids.push(h.state.create_agent(agent).await.unwrap());
    }
    ids
}

async fn seed_tasks(h: &Harness, count: usize) -> Vec<String> {
    let mut ids = Vec::new();
    for i in 0..count {
        let task = Task::new("proj-1", format!("task {}", i), format!("do part {}", i));
        ids.push(h.state.create_task(task).await.unwrap());
    }
    ids
}

async fn wait_for_plan(h: &Harness, plan_id: &str, timeout: Duration) -> PlanStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let plan = h.state.get_plan(plan_id).await.unwrap().unwrap();
        if plan.is_terminal() {
            return plan.status;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("plan {} still {} after {:?}", plan_id, plan.status, timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn plan_request(protocol: PlanProtocol, max_parallel: u32, steps: Vec<CreateStepSpec>) -> CreatePlanRequest {
    CreatePlanRequest {
        project_id: "proj-1".to_string(),
        team_id: None,
        name: "scenario plan".to_string(),
        description: String::new(),
        protocol,
        max_parallel,
        steps,
    }
}

// Scenario 1: sequential happy path. The second step never starts before
// the first reaches a terminal status.
#[tokio::test]
async fn sequential_happy_path() {
    let h = harness(Config::default(), vec![], None).await;
    let agents = seed_agents(&h, &["builder"]).await;
    let tasks = seed_tasks(&h, 2).await;

    let (log, _) = WorkerScript::new(Duration::from_millis(30)).spawn(h.bus.clone()).await;

    let plan = h
        .orchestrator
        .create_plan(plan_request(
            PlanProtocol::Sequential,
            0,
            vec![
                CreateStepSpec::new(&tasks[0], &agents[0]),
                CreateStepSpec::new(&tasks[1], &agents[0]),
            ],
        ))
        .await
        .unwrap();
    h.orchestrator.start_plan(&plan.id).await.unwrap();

    let status = wait_for_plan(&h, &plan.id, Duration::from_secs(5)).await;
    assert_eq!(status, PlanStatus::Completed);

    // Strict interleaving: start 1, complete 1, start 2, complete 2
    let log = log.lock().unwrap().clone();
    assert_eq!(
        log,
        vec![
            format!("start:{}", tasks[0]),
            format!("complete:{}", tasks[0]),
            format!("start:{}", tasks[1]),
            format!("complete:{}", tasks[1]),
        ]
    );

    // Every step completed, every agent back to idle
    let steps = h.state.list_steps(&plan.id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
    let agent = h.state.get_agent(&agents[0]).await.unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);
}

// Scenario 2: parallel respects max-parallel. Four ready steps, limit 2:
// never more than two running at once, all complete.
#[tokio::test]
async fn parallel_respects_max_parallel() {
    let h = harness(Config::default(), vec![], None).await;
    let agents = seed_agents(&h, &["a", "b", "c", "d"]).await;
    let tasks = seed_tasks(&h, 4).await;

    let (_, peak) = WorkerScript::new(Duration::from_millis(50)).spawn(h.bus.clone()).await;

    let steps = tasks
        .iter()
        .zip(agents.iter())
        .map(|(task, agent)| CreateStepSpec::new(task, agent))
        .collect();
    let plan = h
        .orchestrator
        .create_plan(plan_request(PlanProtocol::Parallel, 2, steps))
        .await
        .unwrap();
    h.orchestrator.start_plan(&plan.id).await.unwrap();

    // Immediately after start, exactly two steps are running
    tokio::time::sleep(Duration::from_millis(20)).await;
    let running = h
        .state
        .list_steps(&plan.id)
        .await
        .unwrap()
        .iter()
        .filter(|s| s.status == StepStatus::Running)
        .count();
    assert_eq!(running, 2);

    let status = wait_for_plan(&h, &plan.id, Duration::from_secs(5)).await;
    assert_eq!(status, PlanStatus::Completed);

    assert!(peak.load(Ordering::SeqCst) <= 2, "peak concurrency exceeded max-parallel");
    let steps = h.state.list_steps(&plan.id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
}

// Scenario 3a: consensus with outcomes {completed, completed, failed}
// meets the default quorum of two and completes.
#[tokio::test]
async fn consensus_meets_quorum() {
    let h = harness(Config::default(), vec![], None).await;
    let agents = seed_agents(&h, &["a", "b", "c"]).await;
    let tasks = seed_tasks(&h, 3).await;

    WorkerScript::new(Duration::from_millis(20))
        .failing(&tasks[2..3].to_vec())
        .spawn(h.bus.clone())
        .await;

    let steps = tasks
        .iter()
        .zip(agents.iter())
        .map(|(task, agent)| CreateStepSpec::new(task, agent))
        .collect();
    let plan = h
        .orchestrator
        .create_plan(plan_request(PlanProtocol::Consensus, 0, steps))
        .await
        .unwrap();
    h.orchestrator.start_plan(&plan.id).await.unwrap();

    let status = wait_for_plan(&h, &plan.id, Duration::from_secs(5)).await;
    assert_eq!(status, PlanStatus::Completed);

    let steps = h.state.list_steps(&plan.id).await.unwrap();
    let completed = steps.iter().filter(|s| s.status == StepStatus::Completed).count();
    assert!(completed >= 2);
}

// Scenario 3b: {completed, failed, failed} misses quorum and fails.
#[tokio::test]
async fn consensus_misses_quorum() {
    let h = harness(Config::default(), vec![], None).await;
    let agents = seed_agents(&h, &["a", "b", "c"]).await;
    let tasks = seed_tasks(&h, 3).await;

    WorkerScript::new(Duration::from_millis(20))
        .failing(&tasks[1..3].to_vec())
        .spawn(h.bus.clone())
        .await;

    let steps = tasks
        .iter()
        .zip(agents.iter())
        .map(|(task, agent)| CreateStepSpec::new(task, agent))
        .collect();
    let plan = h
        .orchestrator
        .create_plan(plan_request(PlanProtocol::Consensus, 0, steps))
        .await
        .unwrap();
    h.orchestrator.start_plan(&plan.id).await.unwrap();

    let status = wait_for_plan(&h, &plan.id, Duration::from_secs(5)).await;
    assert_eq!(status, PlanStatus::Failed);

    // Failed consensus means fewer than quorum completed
    let steps = h.state.list_steps(&plan.id).await.unwrap();
    let completed = steps.iter().filter(|s| s.status == StepStatus::Completed).count();
    assert!(completed < 2);
}

// Scenario 4: an unanswered HITL approval denies with a timeout reason
// and the step count does not move.
#[tokio::test]
async fn hitl_timeout_denies() {
    let mut profile = PolicyProfile::bare("asker", PermissionMode::Default);
    profile.rules.push(PermissionRule::new("bash", PermissionDecision::Ask));

    let mut config = Config::default();
    config.run.approval_timeout_secs = 1;

    let h = harness(config, vec![profile], None).await;
    let agents = seed_agents(&h, &["builder"]).await;
    let tasks = seed_tasks(&h, 1).await;

    let run = h
        .runs
        .start(RunStartRequest {
            task_id: tasks[0].clone(),
            agent_id: agents[0].clone(),
            project_id: "proj-1".to_string(),
            team_id: None,
            profile: Some("asker".to_string()),
            exec_mode: ExecMode::Mount,
            mode_id: None,
            workspace: None,
        })
        .await
        .unwrap();

    let mut responses = h.bus.subscribe(subjects::RUN_TOOL_CALL_RESPONSE).await.unwrap();
    h.bus
        .publish(
            subjects::RUN_TOOL_CALL_REQUEST,
            json!({"run-id": run.id, "call-id": "c1", "tool": "bash", "command": "rm -rf build"}),
        )
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(3), responses.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload["decision"], "deny");
    assert!(msg.payload["reason"].as_str().unwrap().contains("timeout"));

    let run = h.state.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.step_count, 0);
}

// Scenario 5: path-deny globs veto the matching rule; the call falls back
// to the profile-mode default instead of the rule's allow.
#[tokio::test]
async fn policy_path_deny_takes_precedence() {
    let mut profile = PolicyProfile::bare("guarded", PermissionMode::Default);
    let mut rule = PermissionRule::new("edit", PermissionDecision::Allow);
    rule.path_allow = vec!["src/**".to_string()];
    rule.path_deny = vec![".env".to_string(), "secrets/**".to_string()];
    profile.rules.push(rule);

    let engine = PolicyEngine::new(vec![profile]);

    let env = ToolCall::new("edit", "c1").with_path(".env");
    assert_eq!(
        engine.evaluate("guarded", &env).unwrap().decision,
        PermissionDecision::Ask
    );

    let src = ToolCall::new("edit", "c2").with_path("src/main.go");
    assert_eq!(
        engine.evaluate("guarded", &src).unwrap().decision,
        PermissionDecision::Allow
    );

    let secret = ToolCall::new("edit", "c3").with_path("secrets/api.key");
    assert_eq!(
        engine.evaluate("guarded", &secret).unwrap().decision,
        PermissionDecision::Ask
    );
}

// Scenario 6: a low-confidence router decision inserts a two-step
// ping-pong debate; its synthesis lands in shared context and the parent
// step then runs for real.
#[tokio::test]
async fn debate_insertion_and_resumption() {
    let llm = Arc::new(CannedLlm {
        response: r#"{"needs_review": true, "confidence": 0.3, "reason": "risky change"}"#.to_string(),
    });
    let router = Arc::new(ReviewRouter::new(llm, 0.7));

    let mut config = Config::default();
    config.orchestrator.debate_rounds = 1;

    let h = harness(config, vec![], Some(router)).await;
    let agents = seed_agents(&h, &["proponent", "moderator"]).await;
    let tasks = seed_tasks(&h, 1).await;

    let (log, _) = WorkerScript::new(Duration::from_millis(20)).spawn(h.bus.clone()).await;

    let team = h
        .pool
        .create_team(CreateTeamRequest {
            project_id: "proj-1".to_string(),
            name: "debate-crew".to_string(),
            protocol_hint: None,
            members: vec![
                TeamMemberSpec {
                    agent_id: agents[0].clone(),
                    role: TeamRole::Coder,
                },
                TeamMemberSpec {
                    agent_id: agents[1].clone(),
                    role: TeamRole::Reviewer,
                },
            ],
        })
        .await
        .unwrap();

    let mut request = plan_request(
        PlanProtocol::Sequential,
        0,
        vec![CreateStepSpec::new(&tasks[0], &agents[0])],
    );
    request.team_id = Some(team.id.clone());
    let plan = h.orchestrator.create_plan(request).await.unwrap();
    h.orchestrator.start_plan(&plan.id).await.unwrap();

    let status = wait_for_plan(&h, &plan.id, Duration::from_secs(10)).await;
    assert_eq!(status, PlanStatus::Completed);

    // Three runs total: proponent round, moderator round, real execution
    let starts = log
        .lock()
        .unwrap()
        .iter()
        .filter(|l| l.starts_with("start:"))
        .count();
    assert_eq!(starts, 3);

    // The synthesis was written for the parent step
    let steps = h.state.list_steps(&plan.id).await.unwrap();
    assert!(steps[0].debated);
    assert_eq!(steps[0].status, StepStatus::Completed);

    let items = h.context.get(&team.id).await.unwrap();
    let synthesis_key = format!("debate_synthesis:{}", steps[0].id);
    assert!(
        items.iter().any(|i| i.key == synthesis_key),
        "missing {} in shared context",
        synthesis_key
    );
}

// Universal invariant: every terminal run leaves its agent idle, and a
// cancelled plan settles its running runs as cancelled.
#[tokio::test]
async fn plan_cancellation_settles_everything() {
    let h = harness(Config::default(), vec![], None).await;
    let agents = seed_agents(&h, &["a", "b"]).await;
    let tasks = seed_tasks(&h, 2).await;

    // No worker: runs stay in flight until cancelled
    let plan = h
        .orchestrator
        .create_plan(plan_request(
            PlanProtocol::Parallel,
            0,
            vec![
                CreateStepSpec::new(&tasks[0], &agents[0]),
                CreateStepSpec::new(&tasks[1], &agents[1]),
            ],
        ))
        .await
        .unwrap();
    h.orchestrator.start_plan(&plan.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    h.orchestrator.cancel_plan(&plan.id).await.unwrap();

    let plan = h.state.get_plan(&plan.id).await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Cancelled);

    let steps = h.state.list_steps(&plan.id).await.unwrap();
    assert!(steps.iter().all(|s| s.is_terminal()));

    for agent_id in &agents {
        let agent = h.state.get_agent(agent_id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
    }

    // Terminal status is monotonic: a late completion changes nothing
    h.bus
        .publish(
            subjects::RUN_COMPLETE,
            json!({
                "run-id": steps[0].last_run_id.clone().unwrap(),
                "status": "completed",
                "step-count": 1,
                "cost-usd": 0.0,
            }),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let plan = h.state.get_plan(&plan.id).await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Cancelled);
}

// Ping-pong alternates the two steps for the configured rounds and then
// completes; the reset-to-pending window never completes the plan early.
#[tokio::test]
async fn ping_pong_alternates_rounds() {
    let h = harness(Config::default(), vec![], None).await;
    let agents = seed_agents(&h, &["ping", "pong"]).await;
    let tasks = seed_tasks(&h, 2).await;

    let (log, _) = WorkerScript::new(Duration::from_millis(15)).spawn(h.bus.clone()).await;

    let plan = h
        .orchestrator
        .create_plan(plan_request(
            PlanProtocol::PingPong,
            0,
            vec![
                CreateStepSpec::new(&tasks[0], &agents[0]),
                CreateStepSpec::new(&tasks[1], &agents[1]),
            ],
        ))
        .await
        .unwrap();
    h.orchestrator.start_plan(&plan.id).await.unwrap();

    let status = wait_for_plan(&h, &plan.id, Duration::from_secs(10)).await;
    assert_eq!(status, PlanStatus::Completed);

    // Default three rounds each, strictly alternating starts
    let starts: Vec<String> = log
        .lock()
        .unwrap()
        .iter()
        .filter(|l| l.starts_with("start:"))
        .cloned()
        .collect();
    assert_eq!(starts.len(), 6);
    let expected: Vec<String> = (0..6)
        .map(|i| format!("start:{}", tasks[i % 2]))
        .collect();
    assert_eq!(starts, expected);

    let steps = h.state.list_steps(&plan.id).await.unwrap();
    assert!(steps.iter().all(|s| s.round == 3));
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
}

// Run cost and step count are monotonic over the run's lifetime.
#[tokio::test]
async fn run_counters_are_monotonic() {
    let profile = PolicyProfile::bare("open", PermissionMode::Delegate);
    let h = harness(Config::default(), vec![profile], None).await;
    let agents = seed_agents(&h, &["builder"]).await;
    let tasks = seed_tasks(&h, 1).await;

    let run = h
        .runs
        .start(RunStartRequest {
            task_id: tasks[0].clone(),
            agent_id: agents[0].clone(),
            project_id: "proj-1".to_string(),
            team_id: None,
            profile: Some("open".to_string()),
            exec_mode: ExecMode::Mount,
            mode_id: None,
            workspace: None,
        })
        .await
        .unwrap();

    let mut responses = h.bus.subscribe(subjects::RUN_TOOL_CALL_RESPONSE).await.unwrap();
    let mut last_steps = 0;
    let mut last_cost = 0.0;

    for i in 0..3 {
        let call_id = format!("c{}", i);
        h.bus
            .publish(
                subjects::RUN_TOOL_CALL_REQUEST,
                json!({"run-id": run.id, "call-id": call_id, "tool": "edit", "path": format!("src/f{}.rs", i)}),
            )
            .await
            .unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(2), responses.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload["decision"], "allow");

        h.bus
            .publish(
                subjects::RUN_TOOL_CALL_RESULT,
                json!({"run-id": run.id, "call-id": call_id, "tool": "edit", "success": true, "output": format!("edit {}", i), "cost-usd": 0.05}),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let snapshot = h.state.get_run(&run.id).await.unwrap().unwrap();
        assert!(snapshot.step_count > last_steps);
        assert!(snapshot.cost_usd > last_cost);
        last_steps = snapshot.step_count;
        last_cost = snapshot.cost_usd;
    }

    assert_eq!(last_steps, 3);
}
