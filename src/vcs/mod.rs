pub mod github;
pub mod mock;
pub mod types;

pub use types::{
    ChangeRequest, ChangeRequestSpec, ChangeRequestState, CiOverall, CiStatusSnapshot,
    ExternalError, LifecycleError, MergeResult, MergeStrategy, PermanentKind, WorkItemId,
};

use async_trait::async_trait;

/// The version-control host that owns change requests, CI results and
/// branches. Every call is an external network call and must be bounded
/// by a timeout in the implementation.
#[async_trait]
pub trait VersionControlHost: Send + Sync {
    /// Find the open change request for the requested branches or create one.
    async fn create_or_get_change_request(
        &self,
        spec: &ChangeRequestSpec,
    ) -> Result<ChangeRequest, ExternalError>;

    /// Current state of a change request as the host sees it.
    async fn fetch_change_request(&self, id: u64) -> Result<ChangeRequest, ExternalError>;

    async fn fetch_ci_status(&self, id: u64) -> Result<CiStatusSnapshot, ExternalError>;

    /// Merge and return the resulting commit, if the host reports one.
    async fn merge_change_request(
        &self,
        id: u64,
        strategy: MergeStrategy,
    ) -> Result<Option<String>, ExternalError>;

    async fn delete_branch(&self, branch: &str) -> Result<(), ExternalError>;
}
