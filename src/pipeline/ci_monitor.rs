use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::observer::{NoopObserver, PipelineObserver};
use super::retry::RetryPolicy;
use super::PipelineError;
use crate::vcs::{CiOverall, CiStatusSnapshot, VersionControlHost};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30 * 60);
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// What to do when CI times out after some checks already passed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialTimeoutPolicy {
    /// Hand the decision to a person
    #[default]
    Escalate,
    /// Treat it like a CI failure and return the item for fixes
    Fail,
}

/// Terminal result of watching CI for one change request.
#[derive(Debug, Clone, PartialEq)]
pub enum CiOutcome {
    Success {
        snapshot: CiStatusSnapshot,
    },
    Failure {
        failed_checks: Vec<String>,
        snapshot: CiStatusSnapshot,
    },
    /// CI never reached a verdict. Distinct from `Failure`: nothing broke,
    /// it just never finished.
    Timeout {
        elapsed: Duration,
        passed_checks: Vec<String>,
        unfinished_checks: Vec<String>,
    },
}

impl CiOutcome {
    /// Timed out after at least one check had already passed.
    pub fn is_partial_timeout(&self) -> bool {
        matches!(self, CiOutcome::Timeout { passed_checks, .. } if !passed_checks.is_empty())
    }

    pub fn label(&self) -> &'static str {
        match self {
            CiOutcome::Success { .. } => "success",
            CiOutcome::Failure { .. } => "failure",
            CiOutcome::Timeout { .. } => "timeout",
        }
    }
}

/// Polls the host's CI status for a change request until it is terminal.
pub struct CiMonitor {
    host: Arc<dyn VersionControlHost>,
    retry: RetryPolicy,
    observer: Arc<dyn PipelineObserver>,
}

impl CiMonitor {
    pub fn new(host: Arc<dyn VersionControlHost>, retry: RetryPolicy) -> Self {
        Self {
            host,
            retry,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Wait for CI on `change_request` to succeed or fail, polling every
    /// `poll_interval`. Gives up with [`CiOutcome::Timeout`] once
    /// `max_duration` has elapsed, including when a status fetch is still
    /// running at the deadline. Cancelling `cancel` stops the wait at the
    /// next suspension point, including mid-fetch.
    #[instrument(skip(self, cancel))]
    pub async fn watch(
        &self,
        change_request: u64,
        poll_interval: Duration,
        max_duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<CiOutcome, PipelineError> {
        let started = Instant::now();
        let deadline = started
            .checked_add(max_duration)
            .unwrap_or_else(|| started + FAR_FUTURE);
        let mut polls = 0u32;
        let mut last_snapshot: Option<CiStatusSnapshot> = None;

        loop {
            let fetch = self
                .retry
                .with_retry("fetch CI status", || self.host.fetch_ci_status(change_request));
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled { stage: "CI wait" }),
                result = tokio::time::timeout_at(deadline, fetch) => result,
            };
            let snapshot = match fetched {
                Ok(result) => result?,
                Err(_elapsed) => {
                    let elapsed = started.elapsed();
                    info!(polls, elapsed_secs = elapsed.as_secs(), "CI wait timed out while fetching status");
                    let (passed_checks, unfinished_checks) = last_snapshot
                        .map(|s| (s.passed_checks(), s.unfinished_checks()))
                        .unwrap_or_default();
                    return Ok(CiOutcome::Timeout {
                        elapsed,
                        passed_checks,
                        unfinished_checks,
                    });
                }
            };
            polls += 1;
            self.observer.ci_polled(change_request, &snapshot);

            match snapshot.overall() {
                CiOverall::Success => {
                    info!(polls, elapsed_secs = started.elapsed().as_secs(), "CI passed");
                    return Ok(CiOutcome::Success { snapshot });
                }
                CiOverall::Failure => {
                    let failed_checks = snapshot.failed_checks();
                    info!(polls, failed = ?failed_checks, "CI failed");
                    return Ok(CiOutcome::Failure {
                        failed_checks,
                        snapshot,
                    });
                }
                CiOverall::Pending => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= max_duration {
                info!(polls, elapsed_secs = elapsed.as_secs(), "CI wait timed out");
                return Ok(CiOutcome::Timeout {
                    elapsed,
                    passed_checks: snapshot.passed_checks(),
                    unfinished_checks: snapshot.unfinished_checks(),
                });
            }

            let wait = poll_interval.min(max_duration - elapsed);
            last_snapshot = Some(snapshot);
            debug!(polls, wait_secs = wait.as_secs(), "CI pending");
            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled { stage: "CI wait" }),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
