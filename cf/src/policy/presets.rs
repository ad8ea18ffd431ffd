//! Built-in policy profiles
//!
//! Custom profiles from configuration are layered over these at engine
//! construction.

use super::profile::{
    PermissionDecision, PermissionMode, PermissionRule, PolicyProfile, TerminationBudget,
};

/// Read-only tools safe under every profile
const READ_TOOLS: &[&str] = &["read", "grep", "glob", "ls", "tree"];

/// The preset profiles every deployment starts from
pub fn builtin_profiles() -> Vec<PolicyProfile> {
    vec![default_profile(), plan_profile(), accept_edits_profile(), delegate_profile()]
}

fn read_rules() -> Vec<PermissionRule> {
    READ_TOOLS
        .iter()
        .map(|t| PermissionRule::new(*t, PermissionDecision::Allow))
        .collect()
}

fn default_profile() -> PolicyProfile {
    let mut rules = read_rules();

    // Version-control inspection is safe; anything else escalates via
    // the mode fallback.
    let mut git_ro = PermissionRule::new("bash", PermissionDecision::Allow);
    git_ro.command_allow = vec![
        "git status".to_string(),
        "git diff".to_string(),
        "git log".to_string(),
        "git show".to_string(),
    ];
    rules.push(git_ro);

    PolicyProfile {
        name: "default".to_string(),
        mode: PermissionMode::Default,
        rules,
        termination: TerminationBudget {
            max_steps: 200,
            max_cost_usd: 10.0,
            timeout_seconds: 3600,
        },
        quality_gate: None,
    }
}

fn plan_profile() -> PolicyProfile {
    PolicyProfile {
        name: "plan".to_string(),
        mode: PermissionMode::Plan,
        rules: read_rules(),
        termination: TerminationBudget {
            max_steps: 100,
            max_cost_usd: 5.0,
            timeout_seconds: 1800,
        },
        quality_gate: None,
    }
}

fn accept_edits_profile() -> PolicyProfile {
    let mut rules = read_rules();
    rules.push(PermissionRule::new("edit", PermissionDecision::Allow));
    rules.push(PermissionRule::new("write", PermissionDecision::Allow));

    // Destructive shell commands still escalate
    let mut bash = PermissionRule::new("bash", PermissionDecision::Allow);
    bash.command_deny = vec!["rm".to_string(), "git push".to_string(), "sudo".to_string()];
    rules.push(bash);

    PolicyProfile {
        name: "accept-edits".to_string(),
        mode: PermissionMode::AcceptEdits,
        rules,
        termination: TerminationBudget {
            max_steps: 400,
            max_cost_usd: 20.0,
            timeout_seconds: 7200,
        },
        quality_gate: None,
    }
}

fn delegate_profile() -> PolicyProfile {
    PolicyProfile {
        name: "delegate".to_string(),
        mode: PermissionMode::Delegate,
        rules: Vec::new(),
        termination: TerminationBudget {
            max_steps: 1000,
            max_cost_usd: 50.0,
            timeout_seconds: 14400,
        },
        quality_gate: None,
    }
}
