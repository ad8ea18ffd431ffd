//! Evaluation dispatcher
//!
//! Registered as a plan-completion callback: for completed plans it
//! replays each step's run events, extracts the tool-call trace tagged
//! with agent and round, and publishes it for offline metric computation.
//! Failed plans and empty traces are skipped silently.

use std::sync::Arc;

use eyre::Result;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, subjects};
use crate::domain::{PlanStatus, StepStatus};
use crate::orchestrator::PlanCallback;
use crate::state::StateManager;

/// Event kinds that form the evaluation trace
const TRACE_KINDS: &[&str] = &["tool-call.request", "tool-call.result"];

/// Publishes completed-plan traces for offline evaluation
pub struct EvaluationDispatcher {
    state: StateManager,
    bus: Arc<dyn MessageBus>,
}

impl EvaluationDispatcher {
    pub fn new(state: StateManager, bus: Arc<dyn MessageBus>) -> Arc<Self> {
        Arc::new(Self { state, bus })
    }

    /// The callback to register with the orchestrator
    pub fn callback(self: &Arc<Self>) -> PlanCallback {
        let dispatcher = Arc::clone(self);
        Arc::new(move |plan_id, status| {
            let dispatcher = Arc::clone(&dispatcher);
            Box::pin(async move { dispatcher.dispatch(&plan_id, status).await })
        })
    }

    /// Extract and publish the tool-call trace of a completed plan
    pub async fn dispatch(&self, plan_id: &str, status: PlanStatus) -> Result<()> {
        if status != PlanStatus::Completed {
            debug!(%plan_id, %status, "evaluation skipped for non-completed plan");
            return Ok(());
        }

        let steps = self.state.list_steps(plan_id).await?;
        let mut messages: Vec<Value> = Vec::new();

        for step in steps {
            if step.status != StepStatus::Completed {
                continue;
            }
            let Some(run_id) = &step.last_run_id else {
                continue;
            };
            let events = match self.state.list_run_events(run_id).await {
                Ok(events) => events,
                Err(e) => {
                    warn!(%run_id, error = %e, "run events unavailable, step skipped");
                    continue;
                }
            };

            for event in events {
                if !TRACE_KINDS.contains(&event.kind.as_str()) {
                    continue;
                }
                let mut message = json!({
                    "kind": event.kind,
                    "step-id": step.id,
                    "agent-id": step.agent_id,
                    "round": step.round,
                    "payload": event.payload,
                });
                // An event authored by a different agent marks a
                // sub-agent delegation under this step's agent
                if let Some(event_agent) = event.payload.get("agent-id").and_then(|v| v.as_str())
                    && event_agent != step.agent_id
                {
                    message["parent-agent"] = json!(step.agent_id);
                }
                messages.push(message);
            }
        }

        if messages.is_empty() {
            debug!(%plan_id, "empty trace, evaluation skipped");
            return Ok(());
        }

        self.bus
            .publish(
                subjects::EVAL_REQUEST,
                json!({"plan-id": plan_id, "messages": messages}),
            )
            .await
            .map_err(|e| eyre::eyre!("evaluation publish failed: {}", e))?;
        info!(%plan_id, messages = messages.len(), "evaluation trace published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::domain::{ExecutionPlan, PlanProtocol, RunEvent, Step};

    async fn seeded_plan(state: &StateManager, step_status: StepStatus, with_events: bool) -> String {
        let plan = ExecutionPlan::new("proj-1", "Plan", PlanProtocol::Sequential);
        state.create_plan(plan.clone()).await.unwrap();

        let mut step = Step::new(&plan.id, "task-1", "agent-1", 0);
        step.set_run("run-1");
        step.set_status(step_status);
        state.create_step(step).await.unwrap();

        if with_events {
            state
                .append_run_event(RunEvent::new(
                    "run-1",
                    "tool-call.request",
                    json!({"call-id": "c1", "tool": "edit", "agent-id": "agent-1"}),
                ))
                .await
                .unwrap();
            state
                .append_run_event(RunEvent::new(
                    "run-1",
                    "tool-call.result",
                    json!({"call-id": "c1", "tool": "edit", "success": true, "agent-id": "sub-agent-7"}),
                ))
                .await
                .unwrap();
            // Lifecycle events are not part of the trace
            state
                .append_run_event(RunEvent::new("run-1", "run-completed", json!({})))
                .await
                .unwrap();
        }
        plan.id
    }

    #[tokio::test]
    async fn test_dispatch_publishes_trace() {
        let state = StateManager::spawn();
        let bus = Arc::new(MemoryBus::new());
        let dispatcher = EvaluationDispatcher::new(state.clone(), bus.clone());
        let plan_id = seeded_plan(&state, StepStatus::Completed, true).await;

        let mut sub = bus.subscribe(subjects::EVAL_REQUEST).await.unwrap();
        dispatcher.dispatch(&plan_id, PlanStatus::Completed).await.unwrap();

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.payload["plan-id"], plan_id);
        let messages = msg.payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["agent-id"], "agent-1");

        // The result authored by another agent is tagged as a delegation
        assert_eq!(messages[1]["parent-agent"], "agent-1");
        assert!(messages[0].get("parent-agent").is_none());
    }

    #[tokio::test]
    async fn test_failed_plans_skipped() {
        let state = StateManager::spawn();
        let bus = Arc::new(MemoryBus::new());
        let dispatcher = EvaluationDispatcher::new(state.clone(), bus.clone());
        let plan_id = seeded_plan(&state, StepStatus::Completed, true).await;

        let mut sub = bus.subscribe(subjects::EVAL_REQUEST).await.unwrap();
        dispatcher.dispatch(&plan_id, PlanStatus::Failed).await.unwrap();
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_empty_trace_skipped() {
        let state = StateManager::spawn();
        let bus = Arc::new(MemoryBus::new());
        let dispatcher = EvaluationDispatcher::new(state.clone(), bus.clone());
        let plan_id = seeded_plan(&state, StepStatus::Completed, false).await;

        let mut sub = bus.subscribe(subjects::EVAL_REQUEST).await.unwrap();
        dispatcher.dispatch(&plan_id, PlanStatus::Completed).await.unwrap();
        assert!(sub.try_recv().is_none());
    }
}
