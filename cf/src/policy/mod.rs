//! Tool-call policy engine
//!
//! Named profiles hold an ordered rule list; the first matching rule wins.
//! No match falls back to the profile's permission-mode default. The
//! profile registry is immutable after construction so in-flight
//! evaluations can never observe a mutation.

mod engine;
mod globs;
mod presets;
mod profile;

pub use engine::{Evaluation, PolicyEngine, PolicyError};
pub use globs::{command_glob_match, command_prefix_match, path_glob_match};
pub use presets::builtin_profiles;
pub use profile::{
    PermissionDecision, PermissionMode, PermissionRule, PolicyProfile, TerminationBudget, ToolCall,
};
