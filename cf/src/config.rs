//! CodeForge configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::ExecMode;
use crate::policy::PolicyProfile;
use crate::sandbox::SandboxLimits;

/// Main CodeForge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Plan orchestrator tuning
    pub orchestrator: OrchestratorConfig,

    /// Run control plane tuning
    pub run: RunConfig,

    /// Correlator / remote-RPC tuning
    pub correlator: CorrelatorConfig,

    /// Retrieval client behavior
    pub retrieval: RetrievalConfig,

    /// Sandbox runtime configuration
    pub sandbox: SandboxConfig,

    /// Git pool configuration
    pub git: GitConfig,

    /// Team assembly limits
    pub team: TeamConfig,

    /// Shared-context limits
    pub context: ContextConfig,

    /// Custom policy profiles layered over the presets
    pub policies: Vec<PolicyProfile>,

    /// MCP server definitions forwarded to workers
    #[serde(rename = "mcp-servers")]
    pub mcp_servers: Vec<McpServerDef>,

    /// Mode descriptors addressable by steps
    pub modes: HashMap<String, ModeDescriptor>,

    /// Microagent prompts forwarded on run start
    #[serde(rename = "microagent-prompts")]
    pub microagent_prompts: Vec<String>,
}

impl Config {
    /// Load configuration with fallback chain: explicit path, then
    /// `.codeforge.yml`, then `~/.config/codeforge/codeforge.yml`, then
    /// defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".codeforge.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("codeforge").join("codeforge.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name (currently only "anthropic" supported)
    pub provider: String,

    /// Model identifier
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 8192,
            timeout_ms: 120_000,
        }
    }
}

/// Plan orchestrator tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Default concurrency for parallel plans with max_parallel = 0
    #[serde(rename = "max-parallel")]
    pub max_parallel: u32,

    /// Rounds per step before a ping-pong plan completes
    #[serde(rename = "ping-pong-max-rounds")]
    pub ping_pong_max_rounds: u32,

    /// Rounds for debate sub-plans (clamped 1..=3)
    #[serde(rename = "debate-rounds")]
    pub debate_rounds: u32,

    /// Review-router confidence threshold below which a debate is held
    #[serde(rename = "review-threshold")]
    pub review_threshold: f64,

    /// Consensus quorum; 0 = majority
    #[serde(rename = "consensus-quorum")]
    pub consensus_quorum: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            ping_pong_max_rounds: 3,
            debate_rounds: 2,
            review_threshold: 0.7,
            consensus_quorum: 0,
        }
    }
}

/// Run control plane tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Profile used when a step names none
    #[serde(rename = "default-profile")]
    pub default_profile: String,

    /// Identical consecutive tool-call results before the run is failed
    #[serde(rename = "stall-threshold")]
    pub stall_threshold: usize,

    /// HITL approval deadline in seconds
    #[serde(rename = "approval-timeout-secs")]
    pub approval_timeout_secs: u64,

    /// Tools bracketed with a checkpoint before execution
    #[serde(rename = "mutating-tools")]
    pub mutating_tools: Vec<String>,

    /// Execution mode for runs the orchestrator starts
    #[serde(rename = "exec-mode")]
    pub exec_mode: ExecMode,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            default_profile: "default".to_string(),
            stall_threshold: 3,
            approval_timeout_secs: 60,
            mutating_tools: vec!["edit".to_string(), "write".to_string(), "bash".to_string()],
            exec_mode: ExecMode::Mount,
        }
    }
}

/// Correlator / remote-RPC tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Circuit-breaker cooldown after a failure, in seconds
    #[serde(rename = "cooldown-secs")]
    pub cooldown_secs: u64,

    /// Per-RPC wait deadline for search requests, in seconds
    #[serde(rename = "search-timeout-secs")]
    pub search_timeout_secs: u64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 30,
            search_timeout_secs: 30,
        }
    }
}

/// Retrieval client behavior
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RetrievalConfig {
    /// When true, sub-agent search is primary and single-shot search is
    /// the fallback; the default is the inverse.
    #[serde(rename = "prefer-subagent")]
    pub prefer_subagent: bool,
}

/// Sandbox runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container runtime binary
    pub runtime: String,

    /// Worker container image
    pub image: String,

    /// Network mode for new containers
    #[serde(rename = "network-mode")]
    pub network_mode: String,

    /// Default resource limits
    pub limits: SandboxLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "codeforge-worker:latest".to_string(),
            network_mode: "none".to_string(),
            limits: SandboxLimits::default(),
        }
    }
}

/// Git pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Concurrent working-tree operations per host
    #[serde(rename = "pool-size")]
    pub pool_size: usize,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self { pool_size: 5 }
    }
}

/// Team assembly limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamConfig {
    /// Maximum members per team
    #[serde(rename = "max-team-size")]
    pub max_team_size: usize,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self { max_team_size: 5 }
    }
}

/// Shared-context limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Estimated-token budget per team context; 0 disables eviction
    #[serde(rename = "token-budget")]
    pub token_budget: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self { token_budget: 32_000 }
    }
}

/// An MCP server definition forwarded to workers on run start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerDef {
    pub name: String,
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// A mode descriptor addressable by steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeDescriptor {
    pub id: String,
    pub name: String,
    pub prompt: String,
}
