//! Sandbox resource limits
//!
//! Overrides apply in order; a non-zero field replaces the base, a zero
//! field inherits. The merged result is capped at 4x the defaults.

use serde::{Deserialize, Serialize};

/// Resource limits for a sandbox container
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// CPU limit in cores
    #[serde(rename = "cpu-limit")]
    pub cpu_limit: f64,

    /// Memory limit in megabytes
    #[serde(rename = "memory-mb")]
    pub memory_mb: u64,

    /// Process count limit
    #[serde(rename = "pids-limit")]
    pub pids_limit: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            cpu_limit: 2.0,
            memory_mb: 2048,
            pids_limit: 256,
        }
    }
}

impl SandboxLimits {
    /// Apply ordered overrides on top of self, then cap at 4x self
    pub fn merged(&self, overrides: &[SandboxLimits]) -> SandboxLimits {
        let mut merged = *self;
        for o in overrides {
            if o.cpu_limit > 0.0 {
                merged.cpu_limit = o.cpu_limit;
            }
            if o.memory_mb > 0 {
                merged.memory_mb = o.memory_mb;
            }
            if o.pids_limit > 0 {
                merged.pids_limit = o.pids_limit;
            }
        }
        merged.cpu_limit = merged.cpu_limit.min(self.cpu_limit * 4.0);
        merged.memory_mb = merged.memory_mb.min(self.memory_mb * 4);
        merged.pids_limit = merged.pids_limit.min(self.pids_limit * 4);
        merged
    }
}
