use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Identifier of a unit of development work (e.g. a user story key).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(pub String);

impl WorkItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What the pipeline asks the host to open (or find) for a work item.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRequestSpec {
    pub work_item: WorkItemId,
    pub source_branch: String,
    pub target_branch: String,
    pub title: String,
    pub description: String,
    pub labels: Vec<String>,
    pub reviewers: Vec<String>,
}

/// Lifecycle of a change request as seen by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeRequestState {
    Open,
    CiPending,
    CiPassed,
    CiFailed,
    Merged,
    Closed,
}

impl ChangeRequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChangeRequestState::Merged | ChangeRequestState::Closed)
    }

    /// Allowed forward moves. Nothing ever goes back to `Open`.
    pub fn can_advance_to(self, next: ChangeRequestState) -> bool {
        use ChangeRequestState::*;
        match (self, next) {
            (Open, CiPending) => true,
            (CiPending, CiPassed) | (CiPending, CiFailed) => true,
            (CiPassed, Merged) => true,
            (from, Closed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ChangeRequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChangeRequestState::Open => "open",
            ChangeRequestState::CiPending => "ci-pending",
            ChangeRequestState::CiPassed => "ci-passed",
            ChangeRequestState::CiFailed => "ci-failed",
            ChangeRequestState::Merged => "merged",
            ChangeRequestState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum LifecycleError {
    #[error("Change request #{id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: u64,
        from: ChangeRequestState,
        to: ChangeRequestState,
    },
}

/// A proposed change pending review and merge.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRequest {
    pub id: u64,
    pub source_branch: String,
    pub target_branch: String,
    pub title: String,
    pub description: String,
    pub labels: Vec<String>,
    pub reviewers: Vec<String>,
    pub state: ChangeRequestState,
    /// Commit the CI checks run against, when the host reports it
    pub head_sha: Option<String>,
}

impl ChangeRequest {
    pub fn advance(&mut self, next: ChangeRequestState) -> Result<(), LifecycleError> {
        if !self.state.can_advance_to(next) {
            return Err(LifecycleError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pending,
    Running,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckConclusion {
    Success,
    Failure,
    Neutral,
}

/// One named CI job for a change request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub status: CheckStatus,
    pub conclusion: Option<CheckConclusion>,
}

impl CheckRun {
    pub fn new(name: &str, status: CheckStatus, conclusion: Option<CheckConclusion>) -> Self {
        Self {
            name: name.to_string(),
            status,
            conclusion,
        }
    }

    fn failed(&self) -> bool {
        self.conclusion == Some(CheckConclusion::Failure)
    }
}

/// Aggregate CI state derived from all check runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CiOverall {
    Pending,
    Success,
    Failure,
}

impl std::fmt::Display for CiOverall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CiOverall::Pending => write!(f, "pending"),
            CiOverall::Success => write!(f, "success"),
            CiOverall::Failure => write!(f, "failure"),
        }
    }
}

/// Check runs for a change request at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CiStatusSnapshot {
    pub checks: Vec<CheckRun>,
}

impl CiStatusSnapshot {
    pub fn new(checks: Vec<CheckRun>) -> Self {
        Self { checks }
    }

    /// Failure if any check failed; success once every check is done and
    /// none failed; pending otherwise. A change with no checks registered
    /// yet is pending, not successful.
    pub fn overall(&self) -> CiOverall {
        if self.checks.iter().any(CheckRun::failed) {
            CiOverall::Failure
        } else if !self.checks.is_empty()
            && self.checks.iter().all(|c| c.status == CheckStatus::Done)
        {
            CiOverall::Success
        } else {
            CiOverall::Pending
        }
    }

    pub fn failed_checks(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| c.failed())
            .map(|c| c.name.clone())
            .collect()
    }

    /// Checks that finished without failing.
    pub fn passed_checks(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Done && !c.failed())
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn unfinished_checks(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| c.status != CheckStatus::Done)
            .map(|c| c.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    #[default]
    Squash,
    Merge,
    Rebase,
}

impl MergeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeStrategy::Squash => "squash",
            MergeStrategy::Merge => "merge",
            MergeStrategy::Rebase => "rebase",
        }
    }
}

/// Outcome of an AutoMerger run.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub change_request_id: u64,
    pub strategy: MergeStrategy,
    pub merge_sha: Option<String>,
    /// The change was merged before this call; nothing was done.
    pub already_merged: bool,
    pub branch_deleted: bool,
}

/// Reasons an external call will fail identically on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentKind {
    MergeConflict,
    PermissionDenied,
    ChangeClosed,
    NotFound,
    Rejected,
}

impl std::fmt::Display for PermanentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PermanentKind::MergeConflict => "merge conflict",
            PermanentKind::PermissionDenied => "permission denied",
            PermanentKind::ChangeClosed => "change request closed",
            PermanentKind::NotFound => "not found",
            PermanentKind::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Failure of a call to the version-control host or another collaborator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExternalError {
    #[error("{operation} failed transiently: {reason}")]
    Transient { operation: String, reason: String },

    #[error("{operation} did not respond within {limit:?}")]
    Timeout { operation: String, limit: Duration },

    #[error("{operation} failed: {kind}: {reason}")]
    Permanent {
        operation: String,
        kind: PermanentKind,
        reason: String,
    },
}

impl ExternalError {
    pub fn transient(operation: &str, reason: impl Into<String>) -> Self {
        ExternalError::Transient {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }

    pub fn permanent(operation: &str, kind: PermanentKind, reason: impl Into<String>) -> Self {
        ExternalError::Permanent {
            operation: operation.to_string(),
            kind,
            reason: reason.into(),
        }
    }

    /// Rate limits, network blips and timeouts are worth another attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ExternalError::Permanent { .. })
    }

    pub fn permanent_kind(&self) -> Option<PermanentKind> {
        match self {
            ExternalError::Permanent { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
