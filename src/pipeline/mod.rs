pub mod ci_monitor;
pub mod dependency;
pub mod escalation;
pub mod merger;
pub mod metrics;
pub mod observer;
pub mod orchestrator;
pub mod retry;
pub mod workspace;

pub use ci_monitor::{CiMonitor, CiOutcome, PartialTimeoutPolicy};
pub use dependency::{
    DependencyGraph, DependencyTrigger, FileStatusStore, InMemoryStatusStore, StatusStore,
    UnblockedItem,
};
pub use escalation::{ConsoleEscalation, EscalationChannel, FixedResponse, HumanResponse};
pub use metrics::{MetricsRecord, Phase};
pub use observer::TracingObserver;
pub use orchestrator::{Collaborators, CycleOutcome, CycleReport, PipelineOrchestrator, PipelineSettings, WorkItemPipeline};
pub use retry::RetryPolicy;
pub use workspace::{GitWorktreeCleanup, NoopWorkspace, WorkspaceManager};

use thiserror::Error;

use crate::review::ValidationError;
use crate::vcs::{ExternalError, LifecycleError};
use dependency::DependencyError;
use retry::RetryError;

/// Errors that end a pipeline cycle.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Review rejected before decision: {0}")]
    Validation(#[from] ValidationError),

    #[error("{operation} still failing after {attempts} attempt(s): {last}")]
    TransientExhausted {
        operation: String,
        attempts: u32,
        last: ExternalError,
    },

    #[error("{0}")]
    PermanentExternal(ExternalError),

    #[error("Dependency update failed: {0}")]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Escalation could not be delivered: {0}")]
    EscalationUnavailable(ExternalError),

    #[error("Pipeline cancelled during {stage}")]
    Cancelled { stage: &'static str },
}

impl From<RetryError<ExternalError>> for PipelineError {
    fn from(err: RetryError<ExternalError>) -> Self {
        match err {
            RetryError::Permanent(e) => PipelineError::PermanentExternal(e),
            RetryError::Exhausted { attempts, last } => {
                let operation = match &last {
                    ExternalError::Transient { operation, .. }
                    | ExternalError::Timeout { operation, .. }
                    | ExternalError::Permanent { operation, .. } => operation.clone(),
                };
                PipelineError::TransientExhausted {
                    operation,
                    attempts,
                    last,
                }
            }
        }
    }
}

impl PipelineError {
    /// Failures of an external system (as opposed to bad input or a bug)
    /// that a person should look at.
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientExhausted { .. } | PipelineError::PermanentExternal(_)
        )
    }

    /// Plain-language explanation for the human-in-the-loop channel.
    pub fn rationale(&self) -> Vec<String> {
        match self {
            PipelineError::Validation(e) => vec![
                format!("A review report was malformed and was not evaluated: {e}"),
                "Regenerate the review before retrying".to_string(),
            ],
            PipelineError::TransientExhausted {
                operation,
                attempts,
                last,
            } => vec![
                format!("{operation} kept failing with temporary errors ({attempts} attempts)"),
                format!("Last error: {last}"),
                "The host may be degraded; retry later or merge manually".to_string(),
            ],
            PipelineError::PermanentExternal(e) => {
                let advice = match e.permanent_kind() {
                    Some(crate::vcs::PermanentKind::MergeConflict) => {
                        "Resolve the merge conflict on the source branch"
                    }
                    Some(crate::vcs::PermanentKind::PermissionDenied) => {
                        "Check the token's permissions on the repository"
                    }
                    Some(crate::vcs::PermanentKind::ChangeClosed) => {
                        "The change request was closed; reopen or recreate it manually"
                    }
                    _ => "Inspect the change request on the host",
                };
                vec![format!("{e}"), advice.to_string()]
            }
            PipelineError::Dependency(e) => vec![format!("Dependent work items were not updated: {e}")],
            PipelineError::Lifecycle(e) => vec![format!("Change request state is inconsistent: {e}")],
            PipelineError::EscalationUnavailable(e) => {
                vec![format!("Could not reach a human reviewer: {e}")]
            }
            PipelineError::Cancelled { stage } => vec![format!("Pipeline was cancelled during {stage}")],
        }
    }
}
