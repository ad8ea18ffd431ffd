//! Policy evaluation
//!
//! Rules are walked in declared order; the first match wins. A rule
//! matches iff the tool name is equal, the sub-pattern (if any) globs the
//! command, no path-deny glob hits, a path-allow glob hits when the list
//! is non-empty, and the command allow/deny prefix lists hold symmetrically.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use super::globs::{command_glob_match, command_prefix_match, path_glob_match};
use super::presets::builtin_profiles;
use super::profile::{PermissionDecision, PermissionRule, PolicyProfile, ToolCall};

/// Errors from policy evaluation
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Unknown policy profile: {0}")]
    UnknownProfile(String),
}

/// Result of evaluating one tool call
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub decision: PermissionDecision,
    pub reason: String,
}

/// Immutable profile registry
pub struct PolicyEngine {
    profiles: HashMap<String, PolicyProfile>,
}

impl PolicyEngine {
    /// Build the registry: custom profiles are layered over the presets
    /// (same name replaces the preset). The registry never mutates after
    /// construction.
    pub fn new(custom: Vec<PolicyProfile>) -> Self {
        let mut profiles: HashMap<String, PolicyProfile> = builtin_profiles()
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        for profile in custom {
            profiles.insert(profile.name.clone(), profile);
        }
        Self { profiles }
    }

    /// Look up a profile by name
    pub fn profile(&self, name: &str) -> Option<&PolicyProfile> {
        self.profiles.get(name)
    }

    /// Evaluate a tool call against a named profile
    pub fn evaluate(&self, profile_name: &str, call: &ToolCall) -> Result<Evaluation, PolicyError> {
        let profile = self
            .profiles
            .get(profile_name)
            .ok_or_else(|| PolicyError::UnknownProfile(profile_name.to_string()))?;

        for (idx, rule) in profile.rules.iter().enumerate() {
            if rule_matches(rule, call) {
                debug!(
                    profile = %profile_name,
                    tool = %call.tool,
                    rule = idx,
                    decision = %rule.decision,
                    "policy: rule matched"
                );
                return Ok(Evaluation {
                    decision: rule.decision,
                    reason: format!("rule {} ({})", idx, rule.tool),
                });
            }
        }

        let fallback = profile.mode.fallback();
        debug!(
            profile = %profile_name,
            tool = %call.tool,
            decision = %fallback,
            "policy: no rule matched, mode fallback"
        );
        Ok(Evaluation {
            decision: fallback,
            reason: format!("profile default ({})", profile.mode),
        })
    }
}

fn rule_matches(rule: &PermissionRule, call: &ToolCall) -> bool {
    if rule.tool != call.tool {
        return false;
    }

    if let Some(ref pattern) = rule.pattern
        && !command_glob_match(pattern, call.command.as_deref().unwrap_or(""))
    {
        return false;
    }

    match call.path.as_deref() {
        Some(path) => {
            if rule.path_deny.iter().any(|g| path_glob_match(g, path)) {
                return false;
            }
            if !rule.path_allow.is_empty() && !rule.path_allow.iter().any(|g| path_glob_match(g, path)) {
                return false;
            }
        }
        // A path constraint cannot be satisfied by a call without a path
        None => {
            if !rule.path_allow.is_empty() {
                return false;
            }
        }
    }

    match call.command.as_deref() {
        Some(command) => {
            if rule.command_deny.iter().any(|p| command_prefix_match(p, command)) {
                return false;
            }
            if !rule.command_allow.is_empty() && !rule.command_allow.iter().any(|p| command_prefix_match(p, command)) {
                return false;
            }
        }
        None => {
            if !rule.command_allow.is_empty() {
                return false;
            }
        }
    }

    true
}
