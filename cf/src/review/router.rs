//! Review router - LLM confidence classifier
//!
//! Decides whether a step should be debated before execution. Unparsable
//! model output yields the safe default (no review, confidence 0.5) so a
//! flaky model can never wedge a plan.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::Step;
use crate::llm::{CompletionRequest, LlmClient, Message, extract_first_json};

/// Routing decision for one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub needs_review: bool,

    /// Classifier confidence in [0, 1]
    pub confidence: f64,

    #[serde(default)]
    pub reason: String,

    #[serde(default)]
    pub suggested_reviewers: Vec<String>,
}

impl RouteDecision {
    /// The default applied when the model response cannot be parsed
    pub fn safe_default() -> Self {
        Self {
            needs_review: false,
            confidence: 0.5,
            reason: "unparsable router response".to_string(),
            suggested_reviewers: Vec::new(),
        }
    }
}

const ROUTER_PROMPT: &str = "You are a review router for a multi-agent coding system. \
Given a task about to be executed by a coding agent, judge whether the task is risky or \
ambiguous enough that two agents should debate the approach first.

Respond with a single JSON object:
{\"needs_review\": bool, \"confidence\": number 0..1, \"reason\": string, \"suggested_reviewers\": [string]}

needs_review is true when the task touches critical paths, is underspecified, or has \
several plausible approaches. confidence is how certain you are in your judgement.";

/// LLM-based debate router
pub struct ReviewRouter {
    llm: Arc<dyn LlmClient>,

    /// Debates trigger when needs_review and confidence < threshold
    threshold: f64,
}

impl ReviewRouter {
    pub fn new(llm: Arc<dyn LlmClient>, threshold: f64) -> Self {
        Self { llm, threshold }
    }

    /// Classify one step
    pub async fn evaluate(&self, step: &Step, task_description: &str) -> RouteDecision {
        let request = CompletionRequest {
            system_prompt: ROUTER_PROMPT.to_string(),
            messages: vec![Message::user(format!(
                "Agent: {}\nTask:\n{}",
                step.agent_id, task_description
            ))],
            temperature: Some(0.0),
            max_tokens: 512,
        };

        let response = match self.llm.complete(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(step_id = %step.id, error = %e, "review router LLM call failed");
                return RouteDecision::safe_default();
            }
        };

        let decision = extract_first_json(&response.content)
            .and_then(|value| serde_json::from_value::<RouteDecision>(value).ok())
            .map(|mut d| {
                d.confidence = d.confidence.clamp(0.0, 1.0);
                d
            })
            .unwrap_or_else(RouteDecision::safe_default);

        debug!(
            step_id = %step.id,
            needs_review = decision.needs_review,
            confidence = decision.confidence,
            "review router decision"
        );
        decision
    }

    /// Whether the decision warrants a debate
    pub fn should_route(&self, decision: &RouteDecision) -> bool {
        decision.needs_review && decision.confidence < self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionResponse, LlmError, TokenUsage};
    use async_trait::async_trait;

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

    struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            Err(LlmError::InvalidResponse("boom".to_string()))
        }
    }

    fn step() -> Step {
        Step::new("plan-1", "task-1", "agent-1", 0)
    }

    #[tokio::test]
    async fn test_parses_decision() {
        let router = ReviewRouter::new(
            Arc::new(CannedLlm {
                response: r#"The task looks risky. {"needs_review": true, "confidence": 0.3, "reason": "auth change"}"#
                    .to_string(),
            }),
            0.7,
        );

        let decision = router.evaluate(&step(), "rewrite the auth middleware").await;
        assert!(decision.needs_review);
        assert!((decision.confidence - 0.3).abs() < 1e-9);
        assert!(router.should_route(&decision));
    }

    #[tokio::test]
    async fn test_unparsable_yields_safe_default() {
        let router = ReviewRouter::new(
            Arc::new(CannedLlm {
                response: "I cannot answer in JSON today".to_string(),
            }),
            0.7,
        );

        let decision = router.evaluate(&step(), "anything").await;
        assert!(!decision.needs_review);
        assert!((decision.confidence - 0.5).abs() < 1e-9);
        assert!(!router.should_route(&decision));
    }

    #[tokio::test]
    async fn test_llm_failure_yields_safe_default() {
        let router = ReviewRouter::new(Arc::new(FailingLlm), 0.7);
        let decision = router.evaluate(&step(), "anything").await;
        assert!(!decision.needs_review);
    }

    #[tokio::test]
    async fn test_confident_review_not_routed() {
        let router = ReviewRouter::new(
            Arc::new(CannedLlm {
                response: r#"{"needs_review": true, "confidence": 0.9, "reason": "sure"}"#.to_string(),
            }),
            0.7,
        );

        let decision = router.evaluate(&step(), "anything").await;
        assert!(decision.needs_review);
        assert!(!router.should_route(&decision));
    }

    #[tokio::test]
    async fn test_confidence_clamped() {
        let router = ReviewRouter::new(
            Arc::new(CannedLlm {
                response: r#"{"needs_review": true, "confidence": 7.5}"#.to_string(),
            }),
            0.7,
        );

        let decision = router.evaluate(&step(), "anything").await;
        assert!(decision.confidence <= 1.0);
    }
}
