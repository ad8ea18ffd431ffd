//! Policy profile types

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Profile-wide default behavior when no rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    /// Read-only planning: unmatched calls are denied
    Plan,
    /// Unmatched calls escalate to the user
    #[default]
    Default,
    /// Edits proceed without asking
    AcceptEdits,
    /// Fully delegated: unmatched calls are allowed
    Delegate,
}

impl PermissionMode {
    /// Decision applied when no rule matches
    pub fn fallback(&self) -> PermissionDecision {
        match self {
            Self::Plan => PermissionDecision::Deny,
            Self::Default => PermissionDecision::Ask,
            Self::AcceptEdits => PermissionDecision::Allow,
            Self::Delegate => PermissionDecision::Allow,
        }
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plan => write!(f, "plan"),
            Self::Default => write!(f, "default"),
            Self::AcceptEdits => write!(f, "accept-edits"),
            Self::Delegate => write!(f, "delegate"),
        }
    }
}

/// Outcome of evaluating a tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    Allow,
    Deny,
    Ask,
}

impl std::fmt::Display for PermissionDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Deny => write!(f, "deny"),
            Self::Ask => write!(f, "ask"),
        }
    }
}

/// One rule in a profile; order within the profile is significant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    /// Tool name, matched exactly
    pub tool: String,

    /// Optional glob matched against the call's command
    #[serde(default)]
    pub pattern: Option<String>,

    /// Decision when the rule matches
    pub decision: PermissionDecision,

    /// Path globs the call's path must match (when non-empty)
    #[serde(default)]
    pub path_allow: Vec<String>,

    /// Path globs that veto the rule
    #[serde(default)]
    pub path_deny: Vec<String>,

    /// Command prefixes the call's command must match (when non-empty)
    #[serde(default)]
    pub command_allow: Vec<String>,

    /// Command prefixes that veto the rule
    #[serde(default)]
    pub command_deny: Vec<String>,
}

impl PermissionRule {
    /// Bare rule: tool name and decision only
    pub fn new(tool: impl Into<String>, decision: PermissionDecision) -> Self {
        Self {
            tool: tool.into(),
            pattern: None,
            decision,
            path_allow: Vec::new(),
            path_deny: Vec::new(),
            command_allow: Vec::new(),
            command_deny: Vec::new(),
        }
    }
}

/// Per-run termination budget; 0 disables the axis
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct TerminationBudget {
    #[serde(rename = "max-steps")]
    pub max_steps: u32,

    #[serde(rename = "max-cost-usd")]
    pub max_cost_usd: f64,

    #[serde(rename = "timeout-seconds")]
    pub timeout_seconds: u64,
}

impl TerminationBudget {
    /// Whether the given counters breach any bounded axis
    pub fn breached(&self, steps: u32, cost_usd: f64, elapsed_secs: u64) -> bool {
        (self.max_steps > 0 && steps >= self.max_steps)
            || (self.max_cost_usd > 0.0 && cost_usd >= self.max_cost_usd)
            || (self.timeout_seconds > 0 && elapsed_secs >= self.timeout_seconds)
    }
}

/// A named, ordered ruleset with mode fallback and termination budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyProfile {
    pub name: String,

    #[serde(default)]
    pub mode: PermissionMode,

    #[serde(default)]
    pub rules: Vec<PermissionRule>,

    #[serde(default)]
    pub termination: TerminationBudget,

    /// Opaque quality-gate descriptor forwarded to workers
    #[serde(default)]
    pub quality_gate: Option<Value>,
}

impl PolicyProfile {
    /// Profile with no rules: everything falls back to the mode
    pub fn bare(name: impl Into<String>, mode: PermissionMode) -> Self {
        Self {
            name: name.into(),
            mode,
            rules: Vec::new(),
            termination: TerminationBudget::default(),
            quality_gate: None,
        }
    }
}

/// A proposed tool call from a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Tool name
    pub tool: String,

    /// Full command string (shell-like tools)
    pub command: Option<String>,

    /// Target path (file tools)
    pub path: Option<String>,

    /// Correlation id, unique within the run
    pub call_id: String,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            command: None,
            path: None,
            call_id: call_id.into(),
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}
