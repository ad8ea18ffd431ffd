//! Pool manager implementation

use eyre::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::context::SharedContextStore;
use crate::domain::{AgentStatus, Team, TeamMember, TeamRole, TeamStatus};
use crate::events::{EventBus, ForgeEvent};
use crate::state::StateManager;

/// Team-sizing strategy chosen by the planner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Single,
    Pair,
    Team,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::Pair => write!(f, "pair"),
            Self::Team => write!(f, "team"),
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "pair" => Ok(Self::Pair),
            "team" => Ok(Self::Team),
            _ => Err(()),
        }
    }
}

/// Auto-sizing heuristic: one subtask works alone, two pair up,
/// three or more get a team.
pub fn strategy_for_subtasks(count: usize) -> Strategy {
    match count {
        0 | 1 => Strategy::Single,
        2 => Strategy::Pair,
        _ => Strategy::Team,
    }
}

/// One requested member
#[derive(Debug, Clone)]
pub struct TeamMemberSpec {
    pub agent_id: String,
    pub role: TeamRole,
}

/// Request to create a team
#[derive(Debug, Clone)]
pub struct CreateTeamRequest {
    pub project_id: String,
    pub name: String,
    pub protocol_hint: Option<crate::domain::PlanProtocol>,
    pub members: Vec<TeamMemberSpec>,
}

/// Team creation and release
#[derive(Clone)]
pub struct PoolManager {
    state: StateManager,
    context: SharedContextStore,
    events: EventBus,
    max_team_size: usize,
}

impl PoolManager {
    pub fn new(state: StateManager, context: SharedContextStore, events: EventBus, max_team_size: usize) -> Self {
        Self {
            state,
            context,
            events,
            max_team_size,
        }
    }

    /// Create a team after validating every member is a known, idle agent
    /// of the project. Shared context is initialised alongside.
    pub async fn create_team(&self, request: CreateTeamRequest) -> Result<Team> {
        if request.members.is_empty() {
            bail!("team must have at least one member");
        }
        if request.members.len() > self.max_team_size {
            bail!(
                "team size {} exceeds maximum {}",
                request.members.len(),
                self.max_team_size
            );
        }

        for member in &request.members {
            let agent = self
                .state
                .get_agent_required(&member.agent_id)
                .await
                .context("team member lookup failed")?;
            if agent.project_id != request.project_id {
                bail!("agent {} belongs to another project", member.agent_id);
            }
            if !agent.is_idle() {
                bail!("agent {} is not idle", member.agent_id);
            }
        }

        let mut team = Team::new(&request.project_id, &request.name);
        team.protocol_hint = request.protocol_hint;
        team.members = request
            .members
            .iter()
            .map(|m| TeamMember {
                agent_id: m.agent_id.clone(),
                role: m.role,
            })
            .collect();
        team.set_status(TeamStatus::Active);

        self.state.create_team(team.clone()).await.context("team create failed")?;
        self.context
            .init(&team.id, &request.project_id)
            .await
            .context("team context init failed")?;

        self.events.emit(ForgeEvent::TeamStatus {
            team_id: team.id.clone(),
            status: TeamStatus::Active,
        });
        info!(team_id = %team.id, members = team.members.len(), "team created");
        Ok(team)
    }

    /// Assemble a team from the project's idle agents for a strategy:
    /// single is one coder, pair is coder plus reviewer, team fills to
    /// the size cap with the last member reviewing.
    pub async fn assemble_for_strategy(&self, project_id: &str, strategy: Strategy, name: &str) -> Result<Team> {
        let agents = self.state.list_agents(project_id).await.context("agent list failed")?;
        let idle: Vec<_> = agents.into_iter().filter(|a| a.is_idle()).collect();

        let wanted = match strategy {
            Strategy::Single => 1,
            Strategy::Pair => 2,
            Strategy::Team => self.max_team_size,
        };
        let take = wanted.min(idle.len());
        if take == 0 {
            bail!("no idle agents available in project {}", project_id);
        }

        let members: Vec<TeamMemberSpec> = idle
            .iter()
            .take(take)
            .enumerate()
            .map(|(idx, agent)| TeamMemberSpec {
                agent_id: agent.id.clone(),
                // The last member reviews whenever there is more than one
                role: if take > 1 && idx == take - 1 {
                    TeamRole::Reviewer
                } else {
                    TeamRole::Coder
                },
            })
            .collect();

        self.create_team(CreateTeamRequest {
            project_id: project_id.to_string(),
            name: name.to_string(),
            protocol_hint: None,
            members,
        })
        .await
    }

    /// Settle the team and release every member back to idle.
    /// Idempotent over missing agents.
    pub async fn cleanup(&self, team_id: &str, failed: bool) -> Result<()> {
        let Some(mut team) = self.state.get_team(team_id).await.context("team lookup failed")? else {
            warn!(%team_id, "cleanup for unknown team skipped");
            return Ok(());
        };

        let status = if failed { TeamStatus::Failed } else { TeamStatus::Completed };
        team.set_status(status);
        self.state.update_team(team.clone()).await.context("team update failed")?;

        for member in &team.members {
            if let Err(e) = self.state.set_agent_status(&member.agent_id, AgentStatus::Idle).await {
                warn!(agent_id = %member.agent_id, error = %e, "agent release failed");
            }
        }

        self.events.emit(ForgeEvent::TeamStatus {
            team_id: team_id.to_string(),
            status,
        });
        info!(%team_id, %status, "team cleaned up");
        Ok(())
    }
}
