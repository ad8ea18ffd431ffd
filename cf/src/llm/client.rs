//! LlmClient trait

use async_trait::async_trait;

use super::error::LlmError;
use super::types::{CompletionRequest, CompletionResponse};

/// The completion contract the core consumes
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Execute a completion request
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}
