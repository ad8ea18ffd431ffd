//! LLM client module
//!
//! The decomposer and review router depend only on the [`LlmClient`]
//! trait; the Anthropic Messages API implementation is the shipped
//! provider.

mod anthropic;
mod client;
mod error;
mod extract;
mod types;

pub use anthropic::AnthropicClient;
pub use client::LlmClient;
pub use error::LlmError;
pub use extract::extract_first_json;
pub use types::{CompletionRequest, CompletionResponse, Message, Role, TokenUsage};

use std::sync::Arc;

use crate::config::LlmConfig;

/// Create an LLM client from configuration
pub fn create_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicClient::from_config(config)?)),
        other => Err(LlmError::InvalidResponse(format!(
            "Unknown LLM provider: '{}'. Supported: anthropic",
            other
        ))),
    }
}
