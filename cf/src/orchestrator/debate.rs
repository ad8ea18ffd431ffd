//! Debate insertion and resumption
//!
//! Before any step starts, the review router may decide the step needs a
//! moderated debate: a fresh two-step ping-pong sub-plan (proponent and
//! moderator) over the same task. The parent step holds in `running`
//! until the sub-plan settles; the moderator's final output is written to
//! shared context as the synthesis, and the parent step re-enters the
//! queue marked as debated.

use eyre::Result;
use tracing::{debug, info, warn};

use crate::domain::{ExecutionPlan, PlanProtocol, PlanStatus, Step, StepStatus};
use crate::events::ForgeEvent;

use super::core::{CreatePlanRequest, CreateStepSpec, DebateLink, Orchestrator};

impl Orchestrator {
    /// Decide whether a step needs a debate, and insert one if so.
    /// Returns true when the step is now held behind a debate sub-plan.
    /// Caller holds the advancement lock.
    pub(super) async fn maybe_debate(
        &self,
        plan: &ExecutionPlan,
        step: &Step,
        finished: &mut Vec<(String, PlanStatus)>,
    ) -> Result<bool> {
        let Some(router) = &self.router else {
            return Ok(false);
        };
        if step.debated {
            return Ok(false);
        }

        let task = self.state.get_task_required(&step.task_id).await?;
        let decision = router.evaluate(step, &task.prompt).await;
        self.events.emit(ForgeEvent::ReviewRouterDecision {
            step_id: step.id.clone(),
            needs_review: decision.needs_review,
            confidence: decision.confidence,
            reason: decision.reason.clone(),
        });

        if !router.should_route(&decision) {
            return Ok(false);
        }

        let moderator = self.pick_moderator(plan, step).await;
        info!(
            step_id = %step.id,
            proponent = %step.agent_id,
            %moderator,
            confidence = decision.confidence,
            "inserting debate"
        );

        // Debate steps are pre-marked debated so they can never recurse
        // into another debate.
        let mut proponent = CreateStepSpec::new(&step.task_id, &step.agent_id);
        proponent.profile = step.profile.clone();
        proponent.debated = true;
        let mut moderator_spec = CreateStepSpec::new(&step.task_id, &moderator);
        moderator_spec.profile = step.profile.clone();
        moderator_spec.debated = true;

        let sub_plan = self
            .create_plan(CreatePlanRequest {
                project_id: plan.project_id.clone(),
                team_id: plan.team_id.clone(),
                name: format!("debate: {}", task.title),
                description: format!("debate ahead of step {}", step.id),
                protocol: PlanProtocol::PingPong,
                max_parallel: 0,
                steps: vec![proponent, moderator_spec],
            })
            .await?;

        self.debates.lock().await.insert(
            sub_plan.id.clone(),
            DebateLink {
                parent_plan_id: plan.id.clone(),
                parent_step_id: step.id.clone(),
            },
        );
        let rounds = self.config.orchestrator.debate_rounds.clamp(1, 3);
        self.round_overrides.lock().await.insert(sub_plan.id.clone(), rounds);

        // The parent step holds in running until the debate settles
        let mut held = step.clone();
        held.set_status(StepStatus::Running);
        self.state.update_step(held).await?;
        self.emit_step(&plan.id, &step.id, StepStatus::Running);

        self.events.emit(ForgeEvent::DebateStatus {
            plan_id: sub_plan.id.clone(),
            parent_step_id: step.id.clone(),
            status: PlanStatus::Running,
        });

        // Already under the advancement lock: drive the sub-plan inline
        let mut sub = self.state.get_plan_required(&sub_plan.id).await?;
        sub.set_status(PlanStatus::Running);
        self.state.update_plan(sub).await?;
        let sub_finished = self.advance_inner(&sub_plan.id).await?;
        finished.extend(sub_finished);

        Ok(true)
    }

    /// Completion callback half of the debate flow: write the synthesis,
    /// release the parent step, re-advance the parent plan.
    pub(super) async fn handle_debate_completion(&self, plan_id: &str, status: PlanStatus) -> Result<()> {
        let Some(link) = self.debates.lock().await.remove(plan_id) else {
            return Ok(());
        };
        self.round_overrides.lock().await.remove(plan_id);

        if status == PlanStatus::Completed {
            if let Err(e) = self.write_synthesis(plan_id, &link).await {
                warn!(%plan_id, error = %e, "debate synthesis write failed");
            }
        } else {
            // The step proceeds without a synthesis
            warn!(%plan_id, %status, "debate sub-plan did not complete");
        }

        let mut step = self.state.get_step_required(&link.parent_step_id).await?;
        step.debated = true;
        step.set_status(StepStatus::Pending);
        self.state.update_step(step).await?;
        self.emit_step(&link.parent_plan_id, &link.parent_step_id, StepStatus::Pending);

        self.events.emit(ForgeEvent::DebateStatus {
            plan_id: plan_id.to_string(),
            parent_step_id: link.parent_step_id.clone(),
            status,
        });

        debug!(%plan_id, parent_plan = %link.parent_plan_id, "debate settled, resuming parent");
        self.advance(&link.parent_plan_id).await
    }

    /// The synthesis is the moderator's (second step's) final run output
    async fn write_synthesis(&self, debate_plan_id: &str, link: &DebateLink) -> Result<()> {
        let steps = self.state.list_steps(debate_plan_id).await?;
        let Some(moderator_step) = steps.iter().find(|s| s.seq == 1) else {
            return Ok(());
        };
        let Some(run_id) = &moderator_step.last_run_id else {
            return Ok(());
        };
        let run = self.state.get_run_required(run_id).await?;
        let Some(output) = run.output.filter(|o| !o.is_empty()) else {
            return Ok(());
        };

        let parent_plan = self.state.get_plan_required(&link.parent_plan_id).await?;
        let Some(team_id) = &parent_plan.team_id else {
            debug!(plan_id = %link.parent_plan_id, "no team, synthesis not shared");
            return Ok(());
        };

        self.context
            .add_item(
                team_id,
                &format!("debate_synthesis:{}", link.parent_step_id),
                &output,
                &moderator_step.agent_id,
            )
            .await?;
        Ok(())
    }

    async fn pick_moderator(&self, plan: &ExecutionPlan, step: &Step) -> String {
        if let Some(team_id) = &plan.team_id
            && let Ok(Some(team)) = self.state.get_team(team_id).await
            && let Some(reviewer) = team.reviewer()
            && reviewer.agent_id != step.agent_id
        {
            return reviewer.agent_id.clone();
        }
        // Self-moderated debate when no distinct reviewer is available
        step.agent_id.clone()
    }
}
