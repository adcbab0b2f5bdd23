//! Sequences one review-to-release cycle for a work item:
//! decision, then CI wait, merge and dependency trigger, or escalation, or
//! a hand-back to the fix loop.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::ci_monitor::{CiMonitor, CiOutcome, PartialTimeoutPolicy, DEFAULT_MAX_WAIT, DEFAULT_POLL_INTERVAL};
use super::dependency::{DependencyTrigger, InMemoryStatusStore, StatusStore, UnblockedItem};
use super::escalation::{Escalation, EscalationChannel, EscalationStage, HumanResponse};
use super::merger::AutoMerger;
use super::metrics::{MetricsRecord, MetricsTracker, Phase, DEFAULT_BOTTLENECK_THRESHOLD};
use super::observer::{NoopObserver, PipelineObserver};
use super::retry::RetryPolicy;
use super::workspace::{NoopWorkspace, WorkspaceManager};
use super::PipelineError;
use crate::review::decision::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::review::types::Severity;
use crate::review::{Decision, DecisionResult, ReviewDecisionEngine, ReviewKind, ReviewReport};
use crate::vcs::{
    ChangeRequest, ChangeRequestSpec, ChangeRequestState, MergeResult, MergeStrategy,
    VersionControlHost, WorkItemId,
};

/// Tunables for one orchestrator, usually built from the config file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    pub confidence_threshold: f64,
    pub poll_interval: Duration,
    pub max_ci_wait: Duration,
    pub partial_timeout_policy: PartialTimeoutPolicy,
    pub merge_strategy: MergeStrategy,
    pub retry: RetryPolicy,
    pub bottleneck_threshold: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_ci_wait: DEFAULT_MAX_WAIT,
            partial_timeout_policy: PartialTimeoutPolicy::default(),
            merge_strategy: MergeStrategy::default(),
            retry: RetryPolicy::default(),
            bottleneck_threshold: DEFAULT_BOTTLENECK_THRESHOLD,
        }
    }
}

/// External systems the pipeline talks to.
pub struct Collaborators {
    pub host: Arc<dyn VersionControlHost>,
    pub escalation: Arc<dyn EscalationChannel>,
    pub workspace: Arc<dyn WorkspaceManager>,
    pub status_store: Arc<dyn StatusStore>,
    pub observer: Arc<dyn PipelineObserver>,
}

impl Collaborators {
    /// No workspace cleanup, an empty dependency graph and no observer.
    pub fn new(host: Arc<dyn VersionControlHost>, escalation: Arc<dyn EscalationChannel>) -> Self {
        Self {
            host,
            escalation,
            workspace: Arc::new(NoopWorkspace),
            status_store: Arc::new(InMemoryStatusStore::default()),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_workspace(mut self, workspace: Arc<dyn WorkspaceManager>) -> Self {
        self.workspace = workspace;
        self
    }

    pub fn with_status_store(mut self, status_store: Arc<dyn StatusStore>) -> Self {
        self.status_store = status_store;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Released {
        merge: MergeResult,
        unblocked: Vec<UnblockedItem>,
    },
    /// Back to the code-fix loop; a new cycle starts upstream.
    ReturnedForFixes { reasons: Vec<String> },
    /// A person was asked and the cycle stops here with their answer.
    Escalated {
        stage: EscalationStage,
        rationale: Vec<String>,
        response: HumanResponse,
    },
    Aborted { rationale: Vec<String> },
}

impl CycleOutcome {
    pub fn is_returned_for_fixes(&self) -> bool {
        matches!(self, CycleOutcome::ReturnedForFixes { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Released { .. } => "released",
            CycleOutcome::ReturnedForFixes { .. } => "returned for fixes",
            CycleOutcome::Escalated { .. } => "escalated",
            CycleOutcome::Aborted { .. } => "aborted",
        }
    }
}

/// Everything that happened in one cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub work_item: WorkItemId,
    pub iteration: u32,
    pub decision: DecisionResult,
    /// Answer to a decision-stage escalation
    pub human_response: Option<HumanResponse>,
    pub change_request: Option<ChangeRequest>,
    pub ci: Option<CiOutcome>,
    pub outcome: CycleOutcome,
    pub metrics: MetricsRecord,
}

/// What the release stage produced before the report is assembled.
struct Release {
    change_request: ChangeRequest,
    /// `None` when an earlier run already merged the change
    ci: Option<CiOutcome>,
    outcome: CycleOutcome,
}

pub struct PipelineOrchestrator {
    settings: PipelineSettings,
    engine: ReviewDecisionEngine,
    host: Arc<dyn VersionControlHost>,
    escalation: Arc<dyn EscalationChannel>,
    observer: Arc<dyn PipelineObserver>,
    ci_monitor: CiMonitor,
    merger: AutoMerger,
    trigger: DependencyTrigger,
}

impl PipelineOrchestrator {
    pub fn new(settings: PipelineSettings, collaborators: Collaborators) -> Self {
        let Collaborators {
            host,
            escalation,
            workspace,
            status_store,
            observer,
        } = collaborators;
        Self {
            settings,
            engine: ReviewDecisionEngine::new(settings.confidence_threshold),
            ci_monitor: CiMonitor::new(host.clone(), settings.retry).with_observer(observer.clone()),
            merger: AutoMerger::new(host.clone(), workspace, settings.retry),
            trigger: DependencyTrigger::new(status_store).with_observer(observer.clone()),
            host,
            escalation,
            observer,
        }
    }

    /// Run one cycle for `spec.work_item` under fix iteration `iteration`.
    ///
    /// Malformed reports are rejected before any decision is made. Once a
    /// cycle returns `Ok`, its outcome is final for this iteration; errors
    /// carry a rationale for whoever picks them up.
    #[instrument(skip_all, fields(work_item = %spec.work_item, iteration = iteration))]
    pub async fn run_cycle(
        &self,
        iteration: u32,
        self_review: &ReviewReport,
        independent: &ReviewReport,
        spec: &ChangeRequestSpec,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, PipelineError> {
        self_review.validate(ReviewKind::SelfReview)?;
        independent.validate(ReviewKind::Independent)?;

        let work_item = &spec.work_item;
        let mut metrics = MetricsTracker::new(iteration)
            .with_threshold(self.settings.bottleneck_threshold)
            .with_observer(self.observer.clone());
        if let Some((start, end)) = self_review.review_window() {
            metrics.record(Phase::SelfReview, start, end);
        }
        if let Some((start, end)) = independent.review_window() {
            metrics.record(Phase::IndependentReview, start, end);
        }

        metrics.start(Phase::Decision);
        let decision = self.engine.decide(self_review, independent);
        metrics.end(Phase::Decision);
        self.observer.decision_made(work_item, &decision);
        info!(decision = %decision.decision, confidence = decision.combined_confidence, "decision made");

        let mut human_response = None;
        let release = match decision.decision {
            Decision::Pass => Some(self.release(spec, &mut metrics, cancel).await?),
            Decision::Fail => None,
            Decision::Escalate => {
                let response = self
                    .escalate(work_item, EscalationStage::Decision, decision.rationale.clone(), cancel)
                    .await?;
                human_response = Some(response);
                match response {
                    HumanResponse::Approve => Some(self.release(spec, &mut metrics, cancel).await?),
                    HumanResponse::RequestChanges | HumanResponse::Abort => None,
                }
            }
        };

        let (change_request, ci, outcome) = match release {
            Some(release) => (Some(release.change_request), release.ci, release.outcome),
            None => {
                let outcome = match human_response {
                    Some(HumanResponse::Abort) => CycleOutcome::Aborted {
                        rationale: decision.rationale.clone(),
                    },
                    _ => CycleOutcome::ReturnedForFixes {
                        reasons: decision.rationale.clone(),
                    },
                };
                (None, None, outcome)
            }
        };
        info!(outcome = outcome.label(), "cycle finished");

        let findings: Vec<Severity> = [self_review, independent]
            .iter()
            .flat_map(|r| r.security_review.vulnerabilities.iter().map(|v| v.severity))
            .collect();

        Ok(CycleReport {
            work_item: work_item.clone(),
            iteration,
            decision,
            human_response,
            change_request,
            ci,
            outcome,
            metrics: metrics.get_metrics(Some(&findings)),
        })
    }

    /// Open (or reuse) the change request, wait for CI, merge and trigger
    /// dependents.
    async fn release(
        &self,
        spec: &ChangeRequestSpec,
        metrics: &mut MetricsTracker,
        cancel: &CancellationToken,
    ) -> Result<Release, PipelineError> {
        let work_item = &spec.work_item;
        let mut change_request = self
            .settings
            .retry
            .with_retry("create change request", || self.host.create_or_get_change_request(spec))
            .await?;
        info!(change_request = change_request.id, state = %change_request.state, "change request ready");
        if change_request.state == ChangeRequestState::Merged {
            info!(change_request = change_request.id, "merged by an earlier run, skipping CI");
            let outcome = self.merge_and_trigger(&mut change_request, work_item, metrics, cancel).await?;
            return Ok(Release {
                change_request,
                ci: None,
                outcome,
            });
        }
        if change_request.state == ChangeRequestState::Open {
            change_request.advance(ChangeRequestState::CiPending)?;
        }

        metrics.start(Phase::CiWait);
        let ci = self
            .ci_monitor
            .watch(
                change_request.id,
                self.settings.poll_interval,
                self.settings.max_ci_wait,
                cancel,
            )
            .await;
        metrics.end(Phase::CiWait);
        let ci = ci?;

        let outcome = match &ci {
            CiOutcome::Success { .. } => {
                change_request.advance(ChangeRequestState::CiPassed)?;
                self.merge_and_trigger(&mut change_request, work_item, metrics, cancel)
                    .await?
            }
            CiOutcome::Failure { failed_checks, .. } => {
                change_request.advance(ChangeRequestState::CiFailed)?;
                CycleOutcome::ReturnedForFixes {
                    reasons: vec![format!("CI failed: {}", failed_checks.join(", "))],
                }
            }
            CiOutcome::Timeout {
                elapsed,
                passed_checks,
                unfinished_checks,
            } => {
                let mut rationale = vec![format!(
                    "CI did not finish within {}s",
                    elapsed.as_secs()
                )];
                if !passed_checks.is_empty() {
                    rationale.push(format!("Passed before the deadline: {}", passed_checks.join(", ")));
                }
                if !unfinished_checks.is_empty() {
                    rationale.push(format!("Still unfinished: {}", unfinished_checks.join(", ")));
                }

                if ci.is_partial_timeout() && self.settings.partial_timeout_policy == PartialTimeoutPolicy::Fail {
                    CycleOutcome::ReturnedForFixes { reasons: rationale }
                } else {
                    self.escalate_terminal(work_item, EscalationStage::CiTimeout, rationale, cancel)
                        .await?
                }
            }
        };

        Ok(Release {
            change_request,
            ci: Some(ci),
            outcome,
        })
    }

    /// Merge (or confirm an earlier merge) and signal dependents. Merge
    /// failures from the host go to a person.
    async fn merge_and_trigger(
        &self,
        change_request: &mut ChangeRequest,
        work_item: &WorkItemId,
        metrics: &mut MetricsTracker,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, PipelineError> {
        metrics.start(Phase::Merge);
        let merged = self
            .merger
            .merge(change_request, work_item, self.settings.merge_strategy)
            .await;
        metrics.end(Phase::Merge);

        match merged {
            Ok(merge) => {
                if change_request.state != ChangeRequestState::Merged {
                    change_request.advance(ChangeRequestState::Merged)?;
                }
                let unblocked = self.trigger.on_released(work_item).await?;
                Ok(CycleOutcome::Released { merge, unblocked })
            }
            Err(e) if e.is_external() => {
                warn!(error = %e, "merge failed");
                self.escalate_terminal(work_item, EscalationStage::MergeFailure, e.rationale(), cancel)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Escalation after which the cycle stops regardless of the answer.
    async fn escalate_terminal(
        &self,
        work_item: &WorkItemId,
        stage: EscalationStage,
        rationale: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, PipelineError> {
        let response = self.escalate(work_item, stage, rationale.clone(), cancel).await?;
        Ok(CycleOutcome::Escalated {
            stage,
            rationale,
            response,
        })
    }

    /// Suspend until a person answers, or the pipeline is cancelled.
    async fn escalate(
        &self,
        work_item: &WorkItemId,
        stage: EscalationStage,
        rationale: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<HumanResponse, PipelineError> {
        let escalation = Escalation {
            work_item: work_item.clone(),
            stage,
            rationale,
        };
        self.observer.escalated(&escalation);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled { stage: "escalation" }),
            response = self.escalation.raise_escalation(&escalation) => {
                response.map_err(PipelineError::EscalationUnavailable)?
            }
        };
        info!(%stage, %response, "escalation answered");
        Ok(response)
    }
}

/// Runs successive cycles for one work item and owns its iteration count.
pub struct WorkItemPipeline<'a> {
    orchestrator: &'a PipelineOrchestrator,
    iteration: u32,
}

impl<'a> WorkItemPipeline<'a> {
    /// Iterations are 1-based; 0 is treated as 1.
    pub fn new(orchestrator: &'a PipelineOrchestrator, iteration: u32) -> Self {
        Self {
            orchestrator,
            iteration: iteration.max(1),
        }
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Run a cycle under the current iteration. An outcome that sends the
    /// item back for fixes moves the counter on for the next cycle.
    pub async fn run_cycle(
        &mut self,
        self_review: &ReviewReport,
        independent: &ReviewReport,
        spec: &ChangeRequestSpec,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, PipelineError> {
        let report = self
            .orchestrator
            .run_cycle(self.iteration, self_review, independent, spec, cancel)
            .await?;
        if report.outcome.is_returned_for_fixes() {
            self.iteration += 1;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::dependency::DependencyGraph;
    use crate::pipeline::escalation::FixedResponse;
    use crate::review::types::fixtures::{clean_report, vulnerability};
    use crate::vcs::mock::{MockCalls, MockHost};
    use crate::vcs::types::{CheckConclusion, CheckRun, CheckStatus};
    use crate::vcs::{CiStatusSnapshot, ExternalError, PermanentKind};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers with a fixed response and keeps every escalation it saw.
    struct RecordingChannel {
        response: HumanResponse,
        seen: Mutex<Vec<Escalation>>,
    }

    impl RecordingChannel {
        fn new(response: HumanResponse) -> Arc<Self> {
            Arc::new(Self {
                response,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn stages(&self) -> Vec<EscalationStage> {
            self.seen.lock().unwrap().iter().map(|e| e.stage).collect()
        }
    }

    #[async_trait]
    impl EscalationChannel for RecordingChannel {
        async fn raise_escalation(&self, escalation: &Escalation) -> Result<HumanResponse, ExternalError> {
            self.seen.lock().unwrap().push(escalation.clone());
            Ok(self.response)
        }
    }

    /// Never answers.
    struct SilentChannel;

    #[async_trait]
    impl EscalationChannel for SilentChannel {
        async fn raise_escalation(&self, _escalation: &Escalation) -> Result<HumanResponse, ExternalError> {
            std::future::pending().await
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            poll_interval: Duration::from_secs(10),
            max_ci_wait: Duration::from_secs(60),
            retry: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_secs(1),
                attempt_timeout: Duration::from_secs(5),
            },
            ..PipelineSettings::default()
        }
    }

    fn spec(item: &str) -> ChangeRequestSpec {
        ChangeRequestSpec {
            work_item: WorkItemId::new(item),
            source_branch: format!("story/{item}"),
            target_branch: "main".to_string(),
            title: format!("Implement {item}"),
            description: String::new(),
            labels: vec!["automated".to_string()],
            reviewers: vec![],
        }
    }

    fn orchestrator(
        host: Arc<MockHost>,
        channel: Arc<dyn EscalationChannel>,
        settings: PipelineSettings,
    ) -> PipelineOrchestrator {
        PipelineOrchestrator::new(settings, Collaborators::new(host, channel))
    }

    fn escalating_reports() -> (ReviewReport, ReviewReport) {
        (clean_report(0.7), clean_report(0.7))
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_pass_releases_and_unblocks_dependents() {
        let host = Arc::new(MockHost::demo());
        let graph = DependencyGraph::from_map(&HashMap::from([(
            "S-2".to_string(),
            vec!["S-1".to_string()],
        )]))
        .unwrap();
        let collaborators = Collaborators::new(host.clone(), Arc::new(FixedResponse(HumanResponse::Abort)))
            .with_status_store(Arc::new(InMemoryStatusStore::new(graph)));
        let orchestrator = PipelineOrchestrator::new(settings(), collaborators);

        let report = orchestrator
            .run_cycle(1, &clean_report(0.95), &clean_report(0.92), &spec("S-1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.decision.decision, Decision::Pass);
        assert!(report.human_response.is_none());
        match &report.outcome {
            CycleOutcome::Released { merge, unblocked } => {
                assert!(!merge.already_merged);
                assert_eq!(unblocked.len(), 1);
                assert_eq!(unblocked[0].work_item, WorkItemId::new("S-2"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let change_request = report.change_request.unwrap();
        assert_eq!(change_request.state, ChangeRequestState::Merged);
        assert_eq!(
            host.change_request(change_request.id).unwrap().state,
            ChangeRequestState::Merged
        );
        assert!(matches!(report.ci, Some(CiOutcome::Success { .. })));
        assert_eq!(host.calls().deleted_branches, vec!["story/S-1".to_string()]);

        assert_eq!(report.metrics.iteration_count, 1);
        for phase in [Phase::Decision, Phase::CiWait, Phase::Merge] {
            assert!(report.metrics.duration(phase).is_some(), "{phase} not timed");
        }
        assert!(report.metrics.duration(Phase::SelfReview).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_decision_fail_returns_for_fixes_without_touching_host() {
        let host = Arc::new(MockHost::demo());
        let channel = RecordingChannel::new(HumanResponse::Approve);
        let orchestrator = orchestrator(host.clone(), channel.clone(), settings());
        let mut self_review = clean_report(0.9);
        self_review.critical_issues = vec!["panics on empty input".to_string()];

        let report = orchestrator
            .run_cycle(1, &self_review, &clean_report(0.9), &spec("S-1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.decision.decision, Decision::Fail);
        match &report.outcome {
            CycleOutcome::ReturnedForFixes { reasons } => assert_eq!(reasons, &report.decision.rationale),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(report.change_request.is_none());
        assert_eq!(host.calls().create_or_get, 0);
        assert!(channel.stages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalation_approved_continues_to_release() {
        let host = Arc::new(MockHost::demo());
        let channel = RecordingChannel::new(HumanResponse::Approve);
        let orchestrator = orchestrator(host.clone(), channel.clone(), settings());
        let (self_review, independent) = escalating_reports();

        let report = orchestrator
            .run_cycle(1, &self_review, &independent, &spec("S-1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.decision.decision, Decision::Escalate);
        assert_eq!(report.human_response, Some(HumanResponse::Approve));
        assert!(matches!(report.outcome, CycleOutcome::Released { .. }));
        assert_eq!(channel.stages(), vec![EscalationStage::Decision]);
        let seen = channel.seen.lock().unwrap();
        assert_eq!(seen[0].rationale, report.decision.rationale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalation_request_changes_and_abort() {
        let (self_review, independent) = escalating_reports();

        let host = Arc::new(MockHost::demo());
        let orchestrator = orchestrator(host.clone(), RecordingChannel::new(HumanResponse::RequestChanges), settings());
        let report = orchestrator
            .run_cycle(2, &self_review, &independent, &spec("S-1"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.outcome.is_returned_for_fixes());
        assert_eq!(report.metrics.iteration_count, 2);

        let orchestrator = orchestrator_with_abort(host.clone());
        let report = orchestrator
            .run_cycle(2, &self_review, &independent, &spec("S-1"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(report.outcome, CycleOutcome::Aborted { .. }));
        assert_eq!(report.human_response, Some(HumanResponse::Abort));
        assert_eq!(host.calls().create_or_get, 0);
    }

    fn orchestrator_with_abort(host: Arc<MockHost>) -> PipelineOrchestrator {
        orchestrator(host, Arc::new(FixedResponse(HumanResponse::Abort)), settings())
    }

    #[tokio::test(start_paused = true)]
    async fn test_ci_failure_returns_for_fixes() {
        let host = Arc::new(MockHost::new());
        host.script_ci(vec![CiStatusSnapshot::new(vec![
            CheckRun::new("build", CheckStatus::Done, Some(CheckConclusion::Success)),
            CheckRun::new("test", CheckStatus::Done, Some(CheckConclusion::Failure)),
        ])]);
        let channel = RecordingChannel::new(HumanResponse::Approve);
        let orchestrator = orchestrator(host.clone(), channel.clone(), settings());

        let report = orchestrator
            .run_cycle(1, &clean_report(0.95), &clean_report(0.95), &spec("S-1"), &CancellationToken::new())
            .await
            .unwrap();

        match &report.outcome {
            CycleOutcome::ReturnedForFixes { reasons } => assert_eq!(reasons, &vec!["CI failed: test".to_string()]),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(report.change_request.unwrap().state, ChangeRequestState::CiFailed);
        assert_eq!(host.calls().merge, 0);
        assert!(channel.stages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ci_timeout_escalates_and_stops() {
        let host = Arc::new(MockHost::new());
        let channel = RecordingChannel::new(HumanResponse::Approve);
        let orchestrator = orchestrator(host.clone(), channel.clone(), settings());

        let report = orchestrator
            .run_cycle(1, &clean_report(0.95), &clean_report(0.95), &spec("S-1"), &CancellationToken::new())
            .await
            .unwrap();

        match &report.outcome {
            CycleOutcome::Escalated {
                stage,
                rationale,
                response,
            } => {
                assert_eq!(*stage, EscalationStage::CiTimeout);
                assert_eq!(*response, HumanResponse::Approve);
                assert!(rationale[0].starts_with("CI did not finish within 60s"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(host.calls().merge, 0);
        assert_eq!(channel.stages(), vec![EscalationStage::CiTimeout]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_timeout_follows_policy() {
        let partial = || {
            CiStatusSnapshot::new(vec![
                CheckRun::new("build", CheckStatus::Done, Some(CheckConclusion::Success)),
                CheckRun::new("e2e", CheckStatus::Pending, None),
            ])
        };

        let host = Arc::new(MockHost::new());
        host.script_ci(vec![partial()]);
        let fail_policy = PipelineSettings {
            partial_timeout_policy: PartialTimeoutPolicy::Fail,
            ..settings()
        };
        let report = orchestrator(host, RecordingChannel::new(HumanResponse::Approve), fail_policy)
            .run_cycle(1, &clean_report(0.95), &clean_report(0.95), &spec("S-1"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.outcome.is_returned_for_fixes());

        let host = Arc::new(MockHost::new());
        host.script_ci(vec![partial()]);
        let report = orchestrator(host, RecordingChannel::new(HumanResponse::Approve), settings())
            .run_cycle(1, &clean_report(0.95), &clean_report(0.95), &spec("S-1"), &CancellationToken::new())
            .await
            .unwrap();
        match report.outcome {
            CycleOutcome::Escalated { rationale, .. } => {
                assert!(rationale.contains(&"Passed before the deadline: build".to_string()));
                assert!(rationale.contains(&"Still unfinished: e2e".to_string()));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_conflict_is_escalated_with_rationale() {
        let host = Arc::new(MockHost::demo());
        host.script_merge_errors(vec![ExternalError::permanent(
            "merge change request",
            PermanentKind::MergeConflict,
            "head branch is out of date",
        )]);
        let channel = RecordingChannel::new(HumanResponse::Abort);
        let orchestrator = orchestrator(host.clone(), channel.clone(), settings());

        let report = orchestrator
            .run_cycle(1, &clean_report(0.95), &clean_report(0.95), &spec("S-1"), &CancellationToken::new())
            .await
            .unwrap();

        match &report.outcome {
            CycleOutcome::Escalated { stage, rationale, .. } => {
                assert_eq!(*stage, EscalationStage::MergeFailure);
                assert!(rationale.iter().any(|r| r.contains("merge conflict")));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(report.change_request.unwrap().state, ChangeRequestState::CiPassed);
        assert!(report.metrics.duration(Phase::Merge).is_some());
        assert_eq!(host.calls().merge, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_merge_retries_are_escalated() {
        let host = Arc::new(MockHost::demo());
        host.script_merge_errors(vec![ExternalError::transient("merge change request", "503"); 3]);
        let channel = RecordingChannel::new(HumanResponse::Approve);
        let report = orchestrator(host.clone(), channel.clone(), settings())
            .run_cycle(1, &clean_report(0.95), &clean_report(0.95), &spec("S-1"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            report.outcome,
            CycleOutcome::Escalated {
                stage: EscalationStage::MergeFailure,
                ..
            }
        ));
        assert_eq!(host.calls().merge, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_applied_but_response_lost_still_releases() {
        let host = Arc::new(MockHost::demo());
        host.script_lost_merge_responses(vec![ExternalError::Timeout {
            operation: "merge change request".to_string(),
            limit: Duration::from_secs(5),
        }]);
        let graph = DependencyGraph::from_map(&HashMap::from([(
            "S-2".to_string(),
            vec!["S-1".to_string()],
        )]))
        .unwrap();
        let channel = RecordingChannel::new(HumanResponse::Abort);
        let collaborators = Collaborators::new(host.clone(), channel.clone())
            .with_status_store(Arc::new(InMemoryStatusStore::new(graph)));
        let orchestrator = PipelineOrchestrator::new(settings(), collaborators);

        let report = orchestrator
            .run_cycle(1, &clean_report(0.95), &clean_report(0.95), &spec("S-1"), &CancellationToken::new())
            .await
            .unwrap();

        match &report.outcome {
            CycleOutcome::Released { merge, unblocked } => {
                assert!(!merge.already_merged);
                assert!(merge.branch_deleted);
                assert_eq!(unblocked[0].work_item, WorkItemId::new("S-2"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(channel.stages().is_empty());
        assert_eq!(host.calls().merge, 1);
        assert_eq!(host.calls().deleted_branches, vec!["story/S-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_after_merge_skips_ci_and_unblocks_dependents() {
        let host = Arc::new(MockHost::demo());
        let first = host.create_or_get_change_request(&spec("S-1")).await.unwrap();
        host.merge_change_request(first.id, MergeStrategy::Squash).await.unwrap();
        let before = host.calls();

        let graph = DependencyGraph::from_map(&HashMap::from([(
            "S-2".to_string(),
            vec!["S-1".to_string()],
        )]))
        .unwrap();
        let collaborators = Collaborators::new(host.clone(), RecordingChannel::new(HumanResponse::Abort))
            .with_status_store(Arc::new(InMemoryStatusStore::new(graph)));
        let orchestrator = PipelineOrchestrator::new(settings(), collaborators);

        let report = orchestrator
            .run_cycle(1, &clean_report(0.95), &clean_report(0.95), &spec("S-1"), &CancellationToken::new())
            .await
            .unwrap();

        match &report.outcome {
            CycleOutcome::Released { merge, unblocked } => {
                assert!(merge.already_merged);
                assert_eq!(unblocked.len(), 1);
                assert_eq!(unblocked[0].work_item, WorkItemId::new("S-2"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(report.ci.is_none());
        let change_request = report.change_request.unwrap();
        assert_eq!(change_request.id, first.id);
        assert_eq!(change_request.state, ChangeRequestState::Merged);

        let after = host.calls();
        assert_eq!(after.merge, before.merge);
        assert_eq!(after.fetch_ci_status, before.fetch_ci_status);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_report_is_rejected_before_decision() {
        let host = Arc::new(MockHost::demo());
        let channel = RecordingChannel::new(HumanResponse::Approve);
        let orchestrator = orchestrator(host.clone(), channel.clone(), settings());
        let mut independent = clean_report(0.9);
        independent.quality_analysis.score = 140.0;

        let err = orchestrator
            .run_cycle(1, &clean_report(0.9), &independent, &spec("S-1"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(host.calls(), MockCalls::default());
        assert!(channel.stages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_ci_wait() {
        let host = Arc::new(MockHost::new());
        let orchestrator = orchestrator(
            host.clone(),
            RecordingChannel::new(HumanResponse::Approve),
            PipelineSettings {
                max_ci_wait: Duration::from_secs(3600),
                ..settings()
            },
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(45)).await;
            trigger.cancel();
        });

        let err = orchestrator
            .run_cycle(1, &clean_report(0.95), &clean_report(0.95), &spec("S-1"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { stage: "CI wait" }));
        assert_eq!(host.calls().merge, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_a_human() {
        let host = Arc::new(MockHost::demo());
        let orchestrator = orchestrator(host, Arc::new(SilentChannel), settings());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });
        let (self_review, independent) = escalating_reports();

        let err = orchestrator
            .run_cycle(1, &self_review, &independent, &spec("S-1"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { stage: "escalation" }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reviewer_timestamps_become_phase_timings() {
        let host = Arc::new(MockHost::demo());
        let orchestrator = orchestrator(host, RecordingChannel::new(HumanResponse::Approve), settings());
        let at = |minute| chrono::Utc.with_ymd_and_hms(2026, 3, 1, 10, minute, 0).unwrap();
        let mut self_review = clean_report(0.95);
        self_review.started_at = Some(at(0));
        self_review.completed_at = Some(at(2));
        let mut independent = clean_report(0.95);
        independent.started_at = Some(at(2));
        independent.completed_at = Some(at(9));
        independent.security_review.vulnerabilities = vec![vulnerability(Severity::Low)];

        let report = orchestrator
            .run_cycle(1, &self_review, &independent, &spec("S-1"), &CancellationToken::new())
            .await
            .unwrap();

        let metrics = &report.metrics;
        assert_eq!(metrics.duration(Phase::SelfReview), Some(Duration::from_secs(120)));
        assert_eq!(metrics.duration(Phase::IndependentReview), Some(Duration::from_secs(420)));
        assert_eq!(metrics.bottlenecks, vec![Phase::IndependentReview]);
        assert_eq!(metrics.findings_count.low, 1);
        assert_eq!(metrics.findings_count.total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_iteration_advances_only_when_returned_for_fixes() {
        let host = Arc::new(MockHost::demo());
        let orchestrator = orchestrator(host, RecordingChannel::new(HumanResponse::Approve), settings());
        let mut pipeline = WorkItemPipeline::new(&orchestrator, 0);
        assert_eq!(pipeline.iteration(), 1);

        let mut failing = clean_report(0.9);
        failing.critical_issues = vec!["missing migration".to_string()];
        let first = pipeline
            .run_cycle(&failing, &clean_report(0.9), &spec("S-1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.metrics.iteration_count, 1);
        assert_eq!(pipeline.iteration(), 2);

        let second = pipeline
            .run_cycle(&clean_report(0.95), &clean_report(0.95), &spec("S-1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.iteration, 2);
        assert!(matches!(second.outcome, CycleOutcome::Released { .. }));
        assert_eq!(pipeline.iteration(), 2);
    }
}
