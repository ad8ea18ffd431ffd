//! Review subsystem
//!
//! [`ReviewRouter`] is the LLM confidence classifier deciding whether a
//! step needs a moderated debate before execution. [`ReviewPolicyEngine`]
//! holds the standing policies (commit-count, cron, pre-merge) that spawn
//! review plans.

mod policies;
mod router;

pub use policies::ReviewPolicyEngine;
pub use router::{ReviewRouter, RouteDecision};
