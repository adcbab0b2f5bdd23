use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::vcs::{ExternalError, PermanentKind, WorkItemId};

/// Owns the local working copies created for work items.
#[async_trait]
pub trait WorkspaceManager: Send + Sync {
    async fn cleanup_working_copy(&self, work_item: &WorkItemId) -> Result<(), ExternalError>;
}

/// Used when no worktree root is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWorkspace;

#[async_trait]
impl WorkspaceManager for NoopWorkspace {
    async fn cleanup_working_copy(&self, _work_item: &WorkItemId) -> Result<(), ExternalError> {
        Ok(())
    }
}

/// Removes `<root>/<work item>` with `git worktree remove`.
#[derive(Debug, Clone)]
pub struct GitWorktreeCleanup {
    root: PathBuf,
    timeout: Duration,
}

impl GitWorktreeCleanup {
    pub fn new(root: PathBuf, timeout: Duration) -> Self {
        Self { root, timeout }
    }

    pub fn worktree_path(&self, work_item: &WorkItemId) -> PathBuf {
        self.root.join(work_item.as_str())
    }
}

#[async_trait]
impl WorkspaceManager for GitWorktreeCleanup {
    async fn cleanup_working_copy(&self, work_item: &WorkItemId) -> Result<(), ExternalError> {
        let operation = "remove worktree";
        let path = self.worktree_path(work_item);
        if !path.exists() {
            debug!(path = %path.display(), "no worktree to remove");
            return Ok(());
        }

        let run = Command::new("git")
            .arg("worktree")
            .arg("remove")
            .arg("--force")
            .arg(&path)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| ExternalError::Timeout {
                operation: operation.to_string(),
                limit: self.timeout,
            })?
            .map_err(|e| ExternalError::transient(operation, e.to_string()))?;

        if output.status.success() {
            debug!(path = %path.display(), "worktree removed");
            Ok(())
        } else {
            Err(ExternalError::permanent(
                operation,
                PermanentKind::Rejected,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}
