//! Checkpoint ledger
//!
//! Brackets every mutating tool call with a working-tree snapshot commit so
//! the user can rewind a run. The ledger is in-memory and best-effort: it
//! does not survive a restart. All git mutations go through the shared
//! [`GitPool`] so at most a bounded number of working-tree operations run
//! at once per host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Commit-message prefix identifying shadow commits
const CHECKPOINT_PREFIX: &str = "codeforge-checkpoint";

/// Errors from checkpoint operations
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Git {command} failed: {stderr}")]
    GitFailed { command: String, stderr: String },

    #[error("Git spawn failed: {0}")]
    Spawn(String),

    #[error("No checkpoints recorded for run {0}")]
    Empty(String),
}

/// Counting semaphore serialising working-tree mutations
#[derive(Clone)]
pub struct GitPool {
    permits: Arc<Semaphore>,
}

impl GitPool {
    /// Create a pool with the given concurrency (clamped to at least 1)
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    async fn acquire(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .expect("git pool closed")
    }
}

impl Default for GitPool {
    fn default() -> Self {
        Self::new(5)
    }
}

/// One recorded snapshot
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Snapshot commit ref
    pub commit: String,

    /// Tool whose call triggered the snapshot
    pub tool: String,

    /// Correlating call id
    pub call_id: String,

    /// Creation time (Unix milliseconds)
    pub created_at: i64,
}

/// Per-run in-memory checkpoint ledger
pub struct CheckpointLedger {
    pool: GitPool,
    checkpoints: Mutex<HashMap<String, Vec<Checkpoint>>>,
    workspaces: Mutex<HashMap<String, PathBuf>>,
}

impl CheckpointLedger {
    pub fn new(pool: GitPool) -> Self {
        Self {
            pool,
            checkpoints: Mutex::new(HashMap::new()),
            workspaces: Mutex::new(HashMap::new()),
        }
    }

    /// Stage everything and record an empty-allowed snapshot commit
    pub async fn create(
        &self,
        run_id: &str,
        workspace: &Path,
        tool: &str,
        call_id: &str,
    ) -> Result<Checkpoint, CheckpointError> {
        let _permit = self.pool.acquire().await;

        git(workspace, &["add", "-A"]).await?;
        git(
            workspace,
            &[
                "commit",
                "--allow-empty",
                "--no-verify",
                "-m",
                &format!("{}: {}", CHECKPOINT_PREFIX, call_id),
            ],
        )
        .await?;
        let commit = git(workspace, &["rev-parse", "HEAD"]).await?.trim().to_string();

        let checkpoint = Checkpoint {
            commit: commit.clone(),
            tool: tool.to_string(),
            call_id: call_id.to_string(),
            created_at: forgestore::now_ms(),
        };

        self.checkpoints
            .lock()
            .await
            .entry(run_id.to_string())
            .or_default()
            .push(checkpoint.clone());
        self.workspaces
            .lock()
            .await
            .insert(run_id.to_string(), workspace.to_path_buf());

        debug!(%run_id, %commit, %tool, "checkpoint created");
        Ok(checkpoint)
    }

    /// Hard reset the working tree to before the first checkpoint
    pub async fn rewind_to_first(&self, run_id: &str) -> Result<(), CheckpointError> {
        let (workspace, commit) = self.bounds(run_id, true).await?;
        let _permit = self.pool.acquire().await;

        git(&workspace, &["reset", "--hard", &format!("{}^", commit)]).await?;
        info!(%run_id, %commit, "rewound to before first checkpoint");
        Ok(())
    }

    /// Hard reset the working tree to before the most recent checkpoint
    pub async fn rewind_to_last(&self, run_id: &str) -> Result<(), CheckpointError> {
        let (workspace, commit) = self.bounds(run_id, false).await?;
        let _permit = self.pool.acquire().await;

        git(&workspace, &["reset", "--hard", &format!("{}^", commit)]).await?;
        info!(%run_id, %commit, "rewound to before last checkpoint");
        Ok(())
    }

    /// Drop the shadow commits while keeping the working-tree state, and
    /// clear the run's ledger entries atomically.
    pub async fn cleanup(&self, run_id: &str) -> Result<(), CheckpointError> {
        let (workspace, first) = match self.bounds(run_id, true).await {
            Ok(found) => found,
            // Nothing recorded: cleanup is a no-op
            Err(CheckpointError::Empty(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        {
            let _permit = self.pool.acquire().await;
            git(&workspace, &["reset", "--soft", &format!("{}^", first)]).await?;
        }

        self.checkpoints.lock().await.remove(run_id);
        self.workspaces.lock().await.remove(run_id);
        info!(%run_id, "checkpoints cleaned up");
        Ok(())
    }

    /// Recorded checkpoints for a run, oldest first
    pub async fn list(&self, run_id: &str) -> Vec<Checkpoint> {
        self.checkpoints
            .lock()
            .await
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn bounds(&self, run_id: &str, first: bool) -> Result<(PathBuf, String), CheckpointError> {
        let checkpoints = self.checkpoints.lock().await;
        let list = checkpoints
            .get(run_id)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| CheckpointError::Empty(run_id.to_string()))?;
        let commit = if first {
            list.first().expect("non-empty").commit.clone()
        } else {
            list.last().expect("non-empty").commit.clone()
        };
        drop(checkpoints);

        let workspace = self
            .workspaces
            .lock()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| CheckpointError::Empty(run_id.to_string()))?;
        Ok((workspace, commit))
    }
}

/// Run a git subcommand, capturing stdout
async fn git(workspace: &Path, args: &[&str]) -> Result<String, CheckpointError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workspace)
        .output()
        .await
        .map_err(|e| CheckpointError::Spawn(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        warn!(command = args.join(" "), %stderr, "git command failed");
        return Err(CheckpointError::GitFailed {
            command: args.join(" "),
            stderr,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;

    fn init_repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let run = |args: &[&str]| {
            let status = StdCommand::new("git")
                .args(args)
                .current_dir(dir.path())
                .status()
                .unwrap();
            assert!(status.success(), "git {:?} failed", args);
        };
        run(&["init", "-q"]);
        run(&["config", "user.email", "test@codeforge.dev"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("base.txt"), "base\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-q", "-m", "base"]);
        dir
    }

    #[tokio::test]
    async fn test_create_records_checkpoint() {
        let repo = init_repo();
        let ledger = CheckpointLedger::new(GitPool::default());

        std::fs::write(repo.path().join("a.txt"), "one\n").unwrap();
        let cp = ledger.create("run-1", repo.path(), "edit", "call-1").await.unwrap();
        assert!(!cp.commit.is_empty());
        assert_eq!(cp.tool, "edit");

        let list = ledger.list("run-1").await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].call_id, "call-1");
    }

    #[tokio::test]
    async fn test_rewind_to_first_discards_changes() {
        let repo = init_repo();
        let ledger = CheckpointLedger::new(GitPool::default());

        std::fs::write(repo.path().join("a.txt"), "one\n").unwrap();
        ledger.create("run-1", repo.path(), "edit", "call-1").await.unwrap();
        std::fs::write(repo.path().join("b.txt"), "two\n").unwrap();
        ledger.create("run-1", repo.path(), "edit", "call-2").await.unwrap();

        ledger.rewind_to_first("run-1").await.unwrap();
        assert!(!repo.path().join("a.txt").exists());
        assert!(!repo.path().join("b.txt").exists());
        assert!(repo.path().join("base.txt").exists());
    }

    #[tokio::test]
    async fn test_rewind_to_last_keeps_earlier_changes() {
        let repo = init_repo();
        let ledger = CheckpointLedger::new(GitPool::default());

        std::fs::write(repo.path().join("a.txt"), "one\n").unwrap();
        ledger.create("run-1", repo.path(), "edit", "call-1").await.unwrap();
        std::fs::write(repo.path().join("b.txt"), "two\n").unwrap();
        ledger.create("run-1", repo.path(), "edit", "call-2").await.unwrap();

        ledger.rewind_to_last("run-1").await.unwrap();
        assert!(repo.path().join("a.txt").exists());
        assert!(!repo.path().join("b.txt").exists());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_tree_and_clears_ledger() {
        let repo = init_repo();
        let ledger = CheckpointLedger::new(GitPool::default());

        std::fs::write(repo.path().join("a.txt"), "one\n").unwrap();
        ledger.create("run-1", repo.path(), "edit", "call-1").await.unwrap();
        std::fs::write(repo.path().join("b.txt"), "two\n").unwrap();
        ledger.create("run-1", repo.path(), "write", "call-2").await.unwrap();

        ledger.cleanup("run-1").await.unwrap();

        // Working tree intact, shadow commits gone
        assert!(repo.path().join("a.txt").exists());
        assert!(repo.path().join("b.txt").exists());
        assert!(ledger.list("run-1").await.is_empty());

        let log = StdCommand::new("git")
            .args(["log", "--oneline"])
            .current_dir(repo.path())
            .output()
            .unwrap();
        let log = String::from_utf8_lossy(&log.stdout).to_string();
        assert!(!log.contains(CHECKPOINT_PREFIX));
    }

    #[tokio::test]
    async fn test_cleanup_without_checkpoints_is_noop() {
        let ledger = CheckpointLedger::new(GitPool::default());
        ledger.cleanup("run-unknown").await.unwrap();
    }

    #[tokio::test]
    async fn test_rewind_without_checkpoints_errors() {
        let ledger = CheckpointLedger::new(GitPool::default());
        assert!(matches!(
            ledger.rewind_to_first("run-unknown").await,
            Err(CheckpointError::Empty(_))
        ));
    }
}
