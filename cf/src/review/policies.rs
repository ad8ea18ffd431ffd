//! Review policy engine
//!
//! Standing policies that spawn review plans: every N pushed commits, on
//! a cron schedule (evaluated by a 60-second ticker), or ahead of a merge
//! into a protected branch.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use crate::domain::{PlanProtocol, PlanStatus, ReviewPolicy, ReviewRecord, ReviewStatus, ReviewTrigger, Task};
use crate::events::{EventBus, ForgeEvent};
use crate::orchestrator::{CreatePlanRequest, CreateStepSpec, Orchestrator, PlanCallback};
use crate::state::StateManager;

/// Cron evaluation cadence
const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Spawns review plans from standing policies
pub struct ReviewPolicyEngine {
    state: StateManager,
    orchestrator: Arc<Orchestrator>,
    events: EventBus,
}

impl ReviewPolicyEngine {
    pub fn new(state: StateManager, orchestrator: Arc<Orchestrator>, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            state,
            orchestrator,
            events,
        })
    }

    /// The plan-completion callback that settles review records
    pub fn callback(self: &Arc<Self>) -> PlanCallback {
        let engine = Arc::clone(self);
        Arc::new(move |plan_id, status| {
            let engine = Arc::clone(&engine);
            Box::pin(async move { engine.settle_review(&plan_id, status).await })
        })
    }

    /// VCS push handler: bump every commit-count policy on the project,
    /// spawning a review whenever a threshold fires.
    pub async fn on_push(&self, project_id: &str, commits: u32) -> Result<Vec<ReviewRecord>> {
        let policies = self.policies_for(project_id, ReviewTrigger::CommitCount).await?;

        let mut spawned = Vec::new();
        for policy in policies {
            let fired = self
                .state
                .bump_commit_counter(&policy.id, commits)
                .await
                .context("commit counter bump failed")?;
            if fired {
                match self.spawn_review(&policy).await {
                    Ok(record) => spawned.push(record),
                    Err(e) => warn!(policy_id = %policy.id, error = %e, "review spawn failed"),
                }
            }
        }
        Ok(spawned)
    }

    /// Pre-merge check: the first policy targeting the branch spawns
    pub async fn pre_merge_check(&self, project_id: &str, target_branch: &str) -> Result<Option<ReviewRecord>> {
        let policies = self.policies_for(project_id, ReviewTrigger::PreMerge).await?;
        for policy in policies {
            let matches = policy
                .branch
                .as_deref()
                .map(|b| b == target_branch)
                .unwrap_or(true);
            if matches {
                let record = self.spawn_review(&policy).await?;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Background ticker evaluating cron policies until cancellation
    pub async fn run_ticker(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick_cron().await {
                        warn!(error = %e, "cron tick failed");
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("review policy ticker stopped");
                    return;
                }
            }
        }
    }

    /// One cron pass: spawn every due policy and re-anchor it
    pub async fn tick_cron(&self) -> Result<()> {
        let policies = self.state.list_review_policies(None).await?;
        let now = Utc::now();

        for mut policy in policies {
            if policy.trigger != ReviewTrigger::Cron {
                continue;
            }
            let Some(expr) = policy.cron_expr.clone() else {
                continue;
            };
            let Some(due) = next_after(&expr, policy.updated_at) else {
                warn!(policy_id = %policy.id, %expr, "unparsable cron expression");
                continue;
            };
            if due > now {
                continue;
            }

            match self.spawn_review(&policy).await {
                Ok(_) => {
                    policy.touch();
                    if let Err(e) = self.state.update_review_policy(policy.clone()).await {
                        warn!(policy_id = %policy.id, error = %e, "cron anchor update failed");
                    }
                }
                Err(e) => warn!(policy_id = %policy.id, error = %e, "cron review spawn failed"),
            }
        }
        Ok(())
    }

    /// Instantiate the policy's pipeline template into a plan and start it
    async fn spawn_review(&self, policy: &ReviewPolicy) -> Result<ReviewRecord> {
        let agents = self.state.list_agents(&policy.project_id).await?;
        let reviewer = agents
            .iter()
            .find(|a| a.is_idle() && a.name.to_lowercase().contains("review"))
            .or_else(|| agents.iter().find(|a| a.is_idle()))
            .or_else(|| agents.first())
            .ok_or_else(|| eyre::eyre!("project {} has no agents for review", policy.project_id))?;

        let task = Task::new(
            &policy.project_id,
            format!("{} review", policy.trigger),
            "Review the recent changes in this project. Report defects, risky patterns \
             and missing tests; propose concrete fixes.",
        );
        self.state.create_task(task.clone()).await.context("review task create failed")?;

        // The default "review-only" template is a single review step;
        // unknown template names fall back to it.
        if policy.pipeline != "review-only" {
            debug!(pipeline = %policy.pipeline, "unknown pipeline template, using review-only");
        }
        let steps = vec![CreateStepSpec::new(&task.id, &reviewer.id)];

        let plan = self
            .orchestrator
            .create_plan(CreatePlanRequest {
                project_id: policy.project_id.clone(),
                team_id: None,
                name: format!("review ({})", policy.trigger),
                description: format!("spawned by policy {}", policy.id),
                protocol: PlanProtocol::Sequential,
                max_parallel: 0,
                steps,
            })
            .await?;

        let record = ReviewRecord::new(&policy.project_id, &policy.id, &plan.id);
        self.state
            .create_review_record(record.clone())
            .await
            .context("review record create failed")?;

        self.orchestrator.start_plan(&plan.id).await?;
        self.events.emit(ForgeEvent::ReviewStatus {
            review_id: record.id.clone(),
            status: ReviewStatus::Running,
        });

        info!(policy_id = %policy.id, plan_id = %plan.id, "review spawned");
        Ok(record)
    }

    /// Flip the review record when its plan settles
    async fn settle_review(&self, plan_id: &str, status: PlanStatus) -> Result<()> {
        let Some(mut record) = self.state.find_review_by_plan(plan_id).await? else {
            return Ok(());
        };
        let review_status = if status == PlanStatus::Completed {
            ReviewStatus::Completed
        } else {
            ReviewStatus::Failed
        };
        record.set_status(review_status);
        self.state.update_review_record(record.clone()).await?;
        self.events.emit(ForgeEvent::ReviewStatus {
            review_id: record.id,
            status: review_status,
        });
        Ok(())
    }

    async fn policies_for(&self, project_id: &str, trigger: ReviewTrigger) -> Result<Vec<ReviewPolicy>> {
        Ok(self
            .state
            .list_review_policies(Some(project_id.to_string()))
            .await?
            .into_iter()
            .filter(|p| p.trigger == trigger)
            .collect())
    }
}

/// Next cron occurrence strictly after the anchor (Unix milliseconds).
/// Five-field expressions are normalised by prepending a seconds field.
fn next_after(expr: &str, anchor_ms: i64) -> Option<DateTime<Utc>> {
    let normalised = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    let schedule = cron::Schedule::from_str(&normalised).ok()?;
    let anchor = DateTime::<Utc>::from_timestamp_millis(anchor_ms)?;
    schedule.after(&anchor).next()
}
