use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::retry::RetryPolicy;
use super::workspace::WorkspaceManager;
use super::PipelineError;
use crate::vcs::{
    ChangeRequest, ChangeRequestState, ExternalError, MergeResult, MergeStrategy, PermanentKind,
    VersionControlHost, WorkItemId,
};

/// Merges a change request whose CI passed, then removes its branch and
/// local working copy.
pub struct AutoMerger {
    host: Arc<dyn VersionControlHost>,
    workspace: Arc<dyn WorkspaceManager>,
    retry: RetryPolicy,
}

impl AutoMerger {
    pub fn new(
        host: Arc<dyn VersionControlHost>,
        workspace: Arc<dyn WorkspaceManager>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            host,
            workspace,
            retry,
        }
    }

    /// Merge `change_request` with `strategy`.
    ///
    /// Safe to call again after a crash: a change the host already reports
    /// as merged is a success with no further side effects. Transient host
    /// errors are retried; permanent ones (conflict, permission, closed)
    /// are returned on first sight. A merge that the host applied but whose
    /// response was lost still counts as this call's merge, so branch
    /// deletion and cleanup run.
    #[instrument(skip(self, change_request, work_item), fields(change_request = change_request.id, work_item = %work_item))]
    pub async fn merge(
        &self,
        change_request: &ChangeRequest,
        work_item: &WorkItemId,
        strategy: MergeStrategy,
    ) -> Result<MergeResult, PipelineError> {
        let id = change_request.id;
        let current = self
            .retry
            .with_retry("fetch change request", || self.host.fetch_change_request(id))
            .await?;

        match current.state {
            ChangeRequestState::Merged => {
                info!("already merged, nothing to do");
                return Ok(MergeResult {
                    change_request_id: id,
                    strategy,
                    merge_sha: None,
                    already_merged: true,
                    branch_deleted: false,
                });
            }
            ChangeRequestState::Closed => {
                return Err(PipelineError::PermanentExternal(ExternalError::permanent(
                    "merge change request",
                    PermanentKind::ChangeClosed,
                    format!("change request #{id} was closed without merging"),
                )));
            }
            _ => {}
        }

        let merge_sha = match self
            .retry
            .with_retry("merge change request", || self.merge_once(id, strategy))
            .await
        {
            Ok(sha) => sha,
            Err(e) => {
                if !self.merged_on_host(id).await {
                    return Err(e.into());
                }
                info!(error = %e, "merge reported failure but the host shows it merged");
                None
            }
        };
        info!(sha = ?merge_sha, strategy = strategy.as_str(), "merged");

        let branch = &change_request.source_branch;
        let branch_deleted = match self
            .retry
            .with_retry("delete branch", || self.host.delete_branch(branch))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(%branch, error = %e, "merged but could not delete source branch");
                false
            }
        };

        if let Err(e) = self.workspace.cleanup_working_copy(work_item).await {
            warn!(error = %e, "working copy cleanup failed");
        }

        Ok(MergeResult {
            change_request_id: id,
            strategy,
            merge_sha,
            already_merged: false,
            branch_deleted,
        })
    }

    /// One merge attempt. The host may apply a merge and then lose the
    /// response, so a failed attempt is checked against the host's state.
    async fn merge_once(&self, id: u64, strategy: MergeStrategy) -> Result<Option<String>, ExternalError> {
        match self.host.merge_change_request(id, strategy).await {
            Ok(sha) => Ok(sha),
            Err(e) => {
                if !self.merged_on_host(id).await {
                    return Err(e);
                }
                debug!(error = %e, "merge attempt failed after the host merged");
                Ok(None)
            }
        }
    }

    /// Whether the host reports `id` as merged. Lookup failures count as no.
    async fn merged_on_host(&self, id: u64) -> bool {
        match tokio::time::timeout(self.retry.attempt_timeout, self.host.fetch_change_request(id)).await {
            Ok(Ok(current)) => current.state == ChangeRequestState::Merged,
            Ok(Err(e)) => {
                debug!(error = %e, "could not re-check change request state");
                false
            }
            Err(_elapsed) => false,
        }
    }
}
