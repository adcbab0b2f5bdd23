use std::time::Duration;
use tracing::{info, warn};

use super::dependency::UnblockedItem;
use super::escalation::Escalation;
use super::metrics::Phase;
use crate::review::DecisionResult;
use crate::vcs::{CiStatusSnapshot, WorkItemId};

/// Receives pipeline events. Every method defaults to a no-op so
/// implementations only override what they care about.
pub trait PipelineObserver: Send + Sync {
    fn decision_made(&self, _work_item: &WorkItemId, _result: &DecisionResult) {}

    fn ci_polled(&self, _change_request: u64, _snapshot: &CiStatusSnapshot) {}

    fn bottleneck(&self, _phase: Phase, _duration: Duration) {}

    fn item_ready(&self, _item: &UnblockedItem) {}

    fn escalated(&self, _escalation: &Escalation) {}
}

/// Observer that ignores everything. The default for every component.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Forwards pipeline events into `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn decision_made(&self, work_item: &WorkItemId, result: &DecisionResult) {
        info!(
            %work_item,
            decision = %result.decision,
            confidence = result.combined_confidence,
            factors = result.trace.len(),
            "review decision"
        );
    }

    fn ci_polled(&self, change_request: u64, snapshot: &CiStatusSnapshot) {
        info!(
            change_request,
            overall = %snapshot.overall(),
            checks = snapshot.checks.len(),
            unfinished = snapshot.unfinished_checks().len(),
            "CI status"
        );
    }

    fn bottleneck(&self, phase: Phase, duration: Duration) {
        warn!(%phase, seconds = duration.as_secs(), "phase exceeded bottleneck threshold");
    }

    fn item_ready(&self, item: &UnblockedItem) {
        info!(work_item = %item.work_item, prerequisites = item.prerequisites.len(), "work item ready");
    }

    fn escalated(&self, escalation: &Escalation) {
        warn!(
            work_item = %escalation.work_item,
            stage = %escalation.stage,
            "escalated to human review"
        );
    }
}
