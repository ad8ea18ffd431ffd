//! Sandbox manager
//!
//! Lifecycle of isolated execution environments by shelling out to the
//! container runtime binary. Containers drop all capabilities, run with
//! no-new-privileges, get a tmpfs scratch mount, and bind-mount the
//! workspace read-only (`mount` mode) or read-write (`hybrid`).

mod limits;

pub use limits::SandboxLimits;

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::ExecMode;

/// Errors from sandbox operations
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Runtime {command} failed: {stderr}")]
    RuntimeFailed { command: String, stderr: String },

    #[error("Runtime spawn failed: {0}")]
    Spawn(String),

    #[error("No sandbox for run {0}")]
    NotFound(String),
}

/// Result of executing a command in a sandbox
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A created sandbox container
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub run_id: String,
    pub container_id: String,
    pub limits: SandboxLimits,
}

/// Container lifecycle manager
pub struct SandboxManager {
    /// Runtime binary ("docker" or "podman")
    runtime: String,

    /// Container image for workers
    image: String,

    /// Base limits from configuration
    defaults: SandboxLimits,

    /// Network mode applied to new containers
    network_mode: String,

    sandboxes: Mutex<HashMap<String, Sandbox>>,
}

impl SandboxManager {
    pub fn new(runtime: impl Into<String>, image: impl Into<String>, defaults: SandboxLimits, network_mode: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            image: image.into(),
            defaults,
            network_mode: network_mode.into(),
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Create a container for a run. Overrides apply in order (policy
    /// level first, then agent level); the merged result is capped at 4x
    /// the configured defaults.
    pub async fn create(
        &self,
        run_id: &str,
        workspace: &Path,
        exec_mode: ExecMode,
        overrides: &[SandboxLimits],
    ) -> Result<Sandbox, SandboxError> {
        let limits = self.defaults.merged(overrides);

        let workspace_mount = match exec_mode {
            ExecMode::Hybrid => format!("{}:/workspace:rw", workspace.display()),
            _ => format!("{}:/workspace:ro", workspace.display()),
        };

        let cpus = format!("{:.2}", limits.cpu_limit);
        let memory = format!("{}m", limits.memory_mb);
        let pids = limits.pids_limit.to_string();
        let name = format!("codeforge-{}", run_id);

        let args = vec![
            "create",
            "--name",
            &name,
            "--cap-drop",
            "ALL",
            "--security-opt",
            "no-new-privileges",
            "--network",
            &self.network_mode,
            "--cpus",
            &cpus,
            "--memory",
            &memory,
            "--pids-limit",
            &pids,
            "--tmpfs",
            "/tmp:rw,size=256m",
            "-v",
            &workspace_mount,
            "-w",
            "/workspace",
            &self.image,
            "sleep",
            "infinity",
        ];

        let container_id = self.runtime_command(&args).await?.trim().to_string();

        let sandbox = Sandbox {
            run_id: run_id.to_string(),
            container_id: container_id.clone(),
            limits,
        };
        self.sandboxes.lock().await.insert(run_id.to_string(), sandbox.clone());

        info!(%run_id, %container_id, "sandbox created");
        Ok(sandbox)
    }

    /// Start a created container
    pub async fn start(&self, run_id: &str) -> Result<(), SandboxError> {
        let container_id = self.container_id(run_id).await?;
        self.runtime_command(&["start", &container_id]).await?;
        debug!(%run_id, "sandbox started");
        Ok(())
    }

    /// Execute a command inside the container
    pub async fn exec(&self, run_id: &str, command: &[&str]) -> Result<ExecOutput, SandboxError> {
        let container_id = self.container_id(run_id).await?;

        let mut args = vec!["exec", container_id.as_str()];
        args.extend_from_slice(command);

        let output = Command::new(&self.runtime)
            .args(&args)
            .output()
            .await
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Stop the container
    pub async fn stop(&self, run_id: &str) -> Result<(), SandboxError> {
        let container_id = self.container_id(run_id).await?;
        self.runtime_command(&["stop", "-t", "5", &container_id]).await?;
        debug!(%run_id, "sandbox stopped");
        Ok(())
    }

    /// Remove the container; unknown runs are a no-op
    pub async fn remove(&self, run_id: &str) -> Result<(), SandboxError> {
        let Some(sandbox) = self.sandboxes.lock().await.remove(run_id) else {
            debug!(%run_id, "sandbox remove: unknown run, skipping");
            return Ok(());
        };

        if let Err(e) = self.runtime_command(&["rm", "-f", &sandbox.container_id]).await {
            warn!(%run_id, error = %e, "sandbox remove failed");
            return Err(e);
        }
        info!(%run_id, "sandbox removed");
        Ok(())
    }

    async fn container_id(&self, run_id: &str) -> Result<String, SandboxError> {
        self.sandboxes
            .lock()
            .await
            .get(run_id)
            .map(|s| s.container_id.clone())
            .ok_or_else(|| SandboxError::NotFound(run_id.to_string()))
    }

    async fn runtime_command(&self, args: &[&str]) -> Result<String, SandboxError> {
        let output = Command::new(&self.runtime)
            .args(args)
            .output()
            .await
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(SandboxError::RuntimeFailed {
                command: args.first().unwrap_or(&"").to_string(),
                stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
