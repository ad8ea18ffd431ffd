//! Decomposer - LLM-driven decomposition of features into plans

use std::str::FromStr;
use std::sync::Arc;

use eyre::{Context, Result, bail};
use serde::Deserialize;
use tracing::{info, warn};

use crate::domain::{Agent, ExecutionPlan, PlanProtocol, Task};
use crate::llm::{CompletionRequest, LlmClient, Message, extract_first_json};
use crate::orchestrator::{CreatePlanRequest, CreateStepSpec, Orchestrator};
use crate::state::StateManager;
use crate::team::{Strategy, strategy_for_subtasks};

use super::sanitize::sanitize_prompt_text;

/// Request to decompose a feature
#[derive(Debug, Clone)]
pub struct DecomposeRequest {
    pub project_id: String,

    /// The user-supplied feature description
    pub feature: String,

    /// Extra context the user attached
    pub context: String,

    /// Model override (None = configured default)
    pub model: Option<String>,

    /// Start the plan immediately after creation
    pub autostart: bool,
}

/// Result of a decomposition
#[derive(Debug, Clone)]
pub struct DecomposedFeature {
    pub plan: ExecutionPlan,
    pub tasks: Vec<Task>,
    pub strategy: Strategy,
    pub warnings: Vec<String>,
}

/// LLM output schema
#[derive(Debug, Deserialize)]
struct DecompositionOutput {
    plan_name: String,

    #[serde(default)]
    description: String,

    #[serde(default)]
    strategy: Option<String>,

    #[serde(default)]
    protocol: Option<String>,

    subtasks: Vec<SubtaskOutput>,
}

#[derive(Debug, Deserialize)]
struct SubtaskOutput {
    title: String,
    prompt: String,

    /// Indices into the subtask list
    #[serde(default)]
    depends_on: Vec<usize>,

    /// Preferred agent backend or name fragment
    #[serde(default)]
    agent_hint: Option<String>,
}

const DECOMPOSE_PROMPT: &str = "You are a software architect decomposing a feature request into \
subtasks for a pool of coding agents.

Respond with a single JSON object:
{
  \"plan_name\": string,
  \"description\": string,
  \"strategy\": \"single\" | \"pair\" | \"team\",
  \"protocol\": \"sequential\" | \"parallel\" | \"ping-pong\" | \"consensus\",
  \"subtasks\": [
    {\"title\": string, \"prompt\": string, \"depends_on\": [int], \"agent_hint\": string}
  ]
}

Guidelines:
- Each subtask must be independently executable by one agent.
- depends_on holds zero-based indices of prerequisite subtasks; no cycles.
- ping-pong requires exactly two subtasks.
- Keep titles short; prompts carry the full instructions.";

/// Feature decomposer
pub struct Decomposer {
    llm: Arc<dyn LlmClient>,
    state: StateManager,
    orchestrator: Arc<Orchestrator>,

    /// Start every plan without waiting for an explicit request
    full_auto: bool,
}

impl Decomposer {
    pub fn new(llm: Arc<dyn LlmClient>, state: StateManager, orchestrator: Arc<Orchestrator>, full_auto: bool) -> Self {
        Self {
            llm,
            state,
            orchestrator,
            full_auto,
        }
    }

    /// Decompose a feature into tasks and a plan
    pub async fn decompose(&self, request: DecomposeRequest) -> Result<DecomposedFeature> {
        let agents = self
            .state
            .list_agents(&request.project_id)
            .await
            .context("agent list failed")?;
        if agents.is_empty() {
            bail!("project {} has no agents to plan for", request.project_id);
        }
        let existing_tasks = self.state.list_tasks(&request.project_id).await.unwrap_or_default();

        let output = self.request_decomposition(&request, &agents, &existing_tasks).await?;
        if output.subtasks.is_empty() {
            bail!("decomposition produced zero subtasks");
        }

        let mut warnings = Vec::new();
        let strategy = output
            .strategy
            .as_deref()
            .and_then(|s| Strategy::from_str(s).ok())
            .unwrap_or_else(|| strategy_for_subtasks(output.subtasks.len()));
        let protocol = self.resolve_protocol(&output, strategy, &mut warnings);

        // Create the tasks, picking an agent for each
        let mut tasks = Vec::with_capacity(output.subtasks.len());
        let mut specs = Vec::with_capacity(output.subtasks.len());
        for (idx, subtask) in output.subtasks.iter().enumerate() {
            let task = Task::new(&request.project_id, &subtask.title, &subtask.prompt);
            self.state.create_task(task.clone()).await.context("task create failed")?;

            let agent = select_agent(&agents, subtask.agent_hint.as_deref());
            let mut spec = CreateStepSpec::new(&task.id, &agent.id);

            // Remap integer indices onto the concrete step ordering;
            // invalid references are dropped with a warning
            let deps: Vec<usize> = subtask
                .depends_on
                .iter()
                .copied()
                .filter(|&dep| {
                    let ok = dep < output.subtasks.len() && dep != idx;
                    if !ok {
                        warnings.push(format!("subtask {} has invalid dependency {}", idx, dep));
                    }
                    ok
                })
                .collect();
            spec = spec.with_deps(deps);

            tasks.push(task);
            specs.push(spec);
        }

        let plan = self
            .orchestrator
            .create_plan(CreatePlanRequest {
                project_id: request.project_id.clone(),
                team_id: None,
                name: output.plan_name.clone(),
                description: output.description.clone(),
                protocol,
                max_parallel: 0,
                steps: specs,
            })
            .await
            .context("plan create failed")?;

        info!(
            plan_id = %plan.id,
            subtasks = tasks.len(),
            %strategy,
            %protocol,
            "feature decomposed"
        );

        if request.autostart || self.full_auto {
            self.orchestrator.start_plan(&plan.id).await.context("plan autostart failed")?;
        }

        Ok(DecomposedFeature {
            plan,
            tasks,
            strategy,
            warnings,
        })
    }

    async fn request_decomposition(
        &self,
        request: &DecomposeRequest,
        agents: &[Agent],
        existing_tasks: &[Task],
    ) -> Result<DecompositionOutput> {
        let feature = sanitize_prompt_text(&request.feature);
        let context = sanitize_prompt_text(&request.context);

        let mut user_prompt = format!("Feature request:\n{}\n", feature);
        if !context.is_empty() {
            user_prompt.push_str(&format!("\nAdditional context:\n{}\n", context));
        }
        user_prompt.push_str("\nAvailable agents:\n");
        for agent in agents {
            user_prompt.push_str(&format!("- {} (backend: {}, {})\n", agent.name, agent.backend, agent.status));
        }
        if !existing_tasks.is_empty() {
            user_prompt.push_str("\nExisting tasks in this project:\n");
            for task in existing_tasks.iter().take(20) {
                user_prompt.push_str(&format!("- {} ({})\n", task.title, task.status));
            }
        }

        let response = self
            .llm
            .complete(CompletionRequest {
                system_prompt: DECOMPOSE_PROMPT.to_string(),
                messages: vec![Message::user(user_prompt)],
                temperature: Some(0.2),
                max_tokens: 4096,
            })
            .await
            .context("decomposition LLM call failed")?;

        let value = extract_first_json(&response.content)
            .ok_or_else(|| eyre::eyre!("decomposition response contained no JSON object"))?;
        serde_json::from_value(value).context("decomposition JSON did not match the expected schema")
    }

    fn resolve_protocol(&self, output: &DecompositionOutput, strategy: Strategy, warnings: &mut Vec<String>) -> PlanProtocol {
        let from_output = output.protocol.as_deref().and_then(parse_protocol);
        let protocol = from_output.unwrap_or(match strategy {
            Strategy::Single => PlanProtocol::Sequential,
            Strategy::Pair => PlanProtocol::PingPong,
            Strategy::Team => PlanProtocol::Parallel,
        });

        // ping-pong is only well-formed over exactly two subtasks
        if protocol == PlanProtocol::PingPong && output.subtasks.len() != 2 {
            warnings.push(format!(
                "ping-pong protocol needs two subtasks, got {}; using sequential",
                output.subtasks.len()
            ));
            return PlanProtocol::Sequential;
        }
        protocol
    }
}

fn parse_protocol(s: &str) -> Option<PlanProtocol> {
    match s {
        "sequential" => Some(PlanProtocol::Sequential),
        "parallel" => Some(PlanProtocol::Parallel),
        "ping-pong" => Some(PlanProtocol::PingPong),
        "consensus" => Some(PlanProtocol::Consensus),
        other => {
            warn!(protocol = %other, "unknown protocol from decomposition");
            None
        }
    }
}

/// Agent selection: backend match first, then name fragment, then any
/// idle agent, then the first.
fn select_agent<'a>(agents: &'a [Agent], hint: Option<&str>) -> &'a Agent {
    if let Some(hint) = hint {
        let hint_lower = hint.to_lowercase();
        if let Some(agent) = agents.iter().find(|a| a.backend.to_lowercase() == hint_lower) {
            return agent;
        }
        if let Some(agent) = agents.iter().find(|a| a.name.to_lowercase().contains(&hint_lower)) {
            return agent;
        }
    }
    agents.iter().find(|a| a.is_idle()).unwrap_or(&agents[0])
}
