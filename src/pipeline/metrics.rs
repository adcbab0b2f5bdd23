use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::observer::{NoopObserver, PipelineObserver};
use crate::review::types::Severity;

/// Phases of one review-to-release cycle that are timed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    SelfReview,
    IndependentReview,
    Decision,
    CiWait,
    Merge,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::SelfReview,
        Phase::IndependentReview,
        Phase::Decision,
        Phase::CiWait,
        Phase::Merge,
    ];
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::SelfReview => "self-review",
            Phase::IndependentReview => "independent-review",
            Phase::Decision => "decision",
            Phase::CiWait => "ci-wait",
            Phase::Merge => "merge",
        };
        f.write_str(s)
    }
}

pub const DEFAULT_BOTTLENECK_THRESHOLD: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhaseTiming {
    pub phase: Phase,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl PhaseTiming {
    /// `end - start`, once the phase has ended.
    pub fn duration(&self) -> Option<Duration> {
        self.end.and_then(|end| (end - self.start).to_std().ok())
    }
}

/// Findings per severity bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FindingsCount {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub info: usize,
    pub unknown: usize,
}

impl FindingsCount {
    pub fn from_severities(severities: &[Severity]) -> Self {
        let mut counts = FindingsCount::default();
        for severity in severities {
            let bucket = match severity {
                Severity::Critical => &mut counts.critical,
                Severity::High => &mut counts.high,
                Severity::Medium => &mut counts.medium,
                Severity::Low => &mut counts.low,
                Severity::Info => &mut counts.info,
                Severity::Unknown => &mut counts.unknown,
            };
            *bucket += 1;
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.critical + self.high + self.medium + self.low + self.info + self.unknown
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsRecord {
    /// Timed phases in pipeline order
    pub phases: Vec<PhaseTiming>,
    pub findings_count: FindingsCount,
    pub iteration_count: u32,
    pub bottlenecks: Vec<Phase>,
}

impl MetricsRecord {
    pub fn duration(&self, phase: Phase) -> Option<Duration> {
        self.phases
            .iter()
            .find(|t| t.phase == phase)
            .and_then(PhaseTiming::duration)
    }
}

/// Timestamp bookkeeping for one cycle.
///
/// The iteration count is fixed at construction; the orchestrator owns
/// incrementing it between cycles.
pub struct MetricsTracker {
    timings: HashMap<Phase, PhaseTiming>,
    iteration_count: u32,
    threshold: Duration,
    bottlenecks: Vec<Phase>,
    observer: Arc<dyn PipelineObserver>,
}

impl MetricsTracker {
    pub fn new(iteration_count: u32) -> Self {
        Self {
            timings: HashMap::new(),
            iteration_count,
            threshold: DEFAULT_BOTTLENECK_THRESHOLD,
            bottlenecks: Vec::new(),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn start(&mut self, phase: Phase) {
        self.start_at(phase, Utc::now());
    }

    pub fn end(&mut self, phase: Phase) {
        self.end_at(phase, Utc::now());
    }

    /// Starting a phase again discards its previous timing.
    pub fn start_at(&mut self, phase: Phase, at: DateTime<Utc>) {
        self.timings.insert(
            phase,
            PhaseTiming {
                phase,
                start: at,
                end: None,
            },
        );
    }

    pub fn end_at(&mut self, phase: Phase, at: DateTime<Utc>) {
        let Some(timing) = self.timings.get_mut(&phase) else {
            debug!(%phase, "end without start ignored");
            return;
        };
        timing.end = Some(at);
        let duration = timing.duration();
        if let Some(duration) = duration {
            self.check_bottleneck(phase, duration);
        }
    }

    /// Record a phase that was timed elsewhere (e.g. by a reviewer).
    pub fn record(&mut self, phase: Phase, start: DateTime<Utc>, end: DateTime<Utc>) {
        self.start_at(phase, start);
        self.end_at(phase, end);
    }

    fn check_bottleneck(&mut self, phase: Phase, duration: Duration) {
        if duration > self.threshold && !self.bottlenecks.contains(&phase) {
            warn!(%phase, seconds = duration.as_secs(), "bottleneck detected");
            self.bottlenecks.push(phase);
            self.observer.bottleneck(phase, duration);
        }
    }

    pub fn get_metrics(&self, findings: Option<&[Severity]>) -> MetricsRecord {
        let phases = Phase::ALL
            .iter()
            .filter_map(|phase| self.timings.get(phase).copied())
            .collect();
        MetricsRecord {
            phases,
            findings_count: findings.map(FindingsCount::from_severities).unwrap_or_default(),
            iteration_count: self.iteration_count,
            bottlenecks: self.bottlenecks.clone(),
        }
    }
}
