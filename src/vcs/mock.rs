//! In-memory version-control host.
//!
//! Drives `release --mock` without a GitHub token, and doubles as the fake
//! host in unit tests: CI snapshots and merge failures are scripted up front
//! and every call is counted.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::types::{
    ChangeRequest, ChangeRequestSpec, ChangeRequestState, CheckConclusion, CheckRun, CheckStatus,
    CiStatusSnapshot, ExternalError, MergeStrategy, PermanentKind,
};
use super::VersionControlHost;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MockCalls {
    pub create_or_get: usize,
    pub fetch_change_request: usize,
    pub fetch_ci_status: usize,
    pub merge: usize,
    pub deleted_branches: Vec<String>,
}

#[derive(Debug)]
struct MockState {
    change_requests: HashMap<u64, ChangeRequest>,
    next_id: u64,
    ci_script: VecDeque<Result<CiStatusSnapshot, ExternalError>>,
    /// Returned once the script runs out
    ci_steady: CiStatusSnapshot,
    /// How long unscripted polls take to answer
    ci_delay: Option<Duration>,
    merge_errors: VecDeque<ExternalError>,
    /// Errors returned after a merge has been applied
    lost_merge_responses: VecDeque<ExternalError>,
    delete_errors: VecDeque<ExternalError>,
    calls: MockCalls,
}

#[derive(Debug)]
pub struct MockHost {
    state: Mutex<MockState>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                change_requests: HashMap::new(),
                next_id: 1,
                ci_script: VecDeque::new(),
                ci_steady: CiStatusSnapshot::new(vec![CheckRun::new("build", CheckStatus::Pending, None)]),
                ci_delay: None,
                merge_errors: VecDeque::new(),
                lost_merge_responses: VecDeque::new(),
                delete_errors: VecDeque::new(),
                calls: MockCalls::default(),
            }),
        }
    }

    /// A host whose CI goes queued → running → green, for demos.
    pub fn demo() -> Self {
        let host = Self::new();
        let build = |status, conclusion| CheckRun::new("build", status, conclusion);
        let test = |status, conclusion| CheckRun::new("test", status, conclusion);
        host.script_ci(vec![
            CiStatusSnapshot::new(vec![
                build(CheckStatus::Pending, None),
                test(CheckStatus::Pending, None),
            ]),
            CiStatusSnapshot::new(vec![
                build(CheckStatus::Done, Some(CheckConclusion::Success)),
                test(CheckStatus::Running, None),
            ]),
            CiStatusSnapshot::new(vec![
                build(CheckStatus::Done, Some(CheckConclusion::Success)),
                test(CheckStatus::Done, Some(CheckConclusion::Success)),
            ]),
        ]);
        host
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshots returned by successive CI polls; the last one repeats.
    pub fn script_ci(&self, snapshots: Vec<CiStatusSnapshot>) {
        let mut state = self.lock();
        if let Some(last) = snapshots.last() {
            state.ci_steady = last.clone();
        }
        state.ci_script.extend(snapshots.into_iter().map(Ok));
    }

    /// Make polls past the end of the script take `delay` to answer.
    pub fn script_ci_delay(&self, delay: Duration) {
        self.lock().ci_delay = Some(delay);
    }

    /// Queue a failure for the next CI poll.
    pub fn fail_next_ci_poll(&self, error: ExternalError) {
        self.lock().ci_script.push_front(Err(error));
    }

    /// Errors returned by the next merge attempts, in order.
    pub fn script_merge_errors(&self, errors: Vec<ExternalError>) {
        self.lock().merge_errors.extend(errors);
    }

    /// Apply the next merges, then fail them with these errors, as a host
    /// does when the response is lost on the way back.
    pub fn script_lost_merge_responses(&self, errors: Vec<ExternalError>) {
        self.lock().lost_merge_responses.extend(errors);
    }

    pub fn script_delete_errors(&self, errors: Vec<ExternalError>) {
        self.lock().delete_errors.extend(errors);
    }

    pub fn insert_change_request(&self, change_request: ChangeRequest) {
        let mut state = self.lock();
        state.next_id = state.next_id.max(change_request.id + 1);
        state.change_requests.insert(change_request.id, change_request);
    }

    pub fn change_request(&self, id: u64) -> Option<ChangeRequest> {
        self.lock().change_requests.get(&id).cloned()
    }

    pub fn calls(&self) -> MockCalls {
        self.lock().calls.clone()
    }

    fn missing(operation: &str, id: u64) -> ExternalError {
        ExternalError::permanent(operation, PermanentKind::NotFound, format!("no change request #{id}"))
    }
}

#[async_trait]
impl VersionControlHost for MockHost {
    async fn create_or_get_change_request(
        &self,
        spec: &ChangeRequestSpec,
    ) -> Result<ChangeRequest, ExternalError> {
        let mut state = self.lock();
        state.calls.create_or_get += 1;

        let same_branches = |cr: &&ChangeRequest| {
            cr.source_branch == spec.source_branch && cr.target_branch == spec.target_branch
        };
        let open = state
            .change_requests
            .values()
            .filter(same_branches)
            .find(|cr| !cr.state.is_terminal());
        let merged = || {
            state
                .change_requests
                .values()
                .filter(same_branches)
                .find(|cr| cr.state == ChangeRequestState::Merged)
        };
        if let Some(cr) = open.or_else(merged) {
            return Ok(cr.clone());
        }

        let id = state.next_id;
        state.next_id += 1;
        let change_request = ChangeRequest {
            id,
            source_branch: spec.source_branch.clone(),
            target_branch: spec.target_branch.clone(),
            title: spec.title.clone(),
            description: spec.description.clone(),
            labels: spec.labels.clone(),
            reviewers: spec.reviewers.clone(),
            state: ChangeRequestState::Open,
            head_sha: Some(format!("mock-head-{id}")),
        };
        state.change_requests.insert(id, change_request.clone());
        Ok(change_request)
    }

    async fn fetch_change_request(&self, id: u64) -> Result<ChangeRequest, ExternalError> {
        let mut state = self.lock();
        state.calls.fetch_change_request += 1;
        state
            .change_requests
            .get(&id)
            .cloned()
            .ok_or_else(|| Self::missing("fetch change request", id))
    }

    async fn fetch_ci_status(&self, _id: u64) -> Result<CiStatusSnapshot, ExternalError> {
        let (next, delay) = {
            let mut state = self.lock();
            state.calls.fetch_ci_status += 1;
            match state.ci_script.pop_front() {
                Some(next) => (next, None),
                None => (Ok(state.ci_steady.clone()), state.ci_delay),
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        next
    }

    async fn merge_change_request(
        &self,
        id: u64,
        _strategy: MergeStrategy,
    ) -> Result<Option<String>, ExternalError> {
        let operation = "merge change request";
        let mut guard = self.lock();
        let state = &mut *guard;
        state.calls.merge += 1;
        if let Some(error) = state.merge_errors.pop_front() {
            return Err(error);
        }
        let change_request = state
            .change_requests
            .get_mut(&id)
            .ok_or_else(|| Self::missing(operation, id))?;
        match change_request.state {
            ChangeRequestState::Closed => Err(ExternalError::permanent(
                operation,
                PermanentKind::ChangeClosed,
                format!("#{id} is closed"),
            )),
            ChangeRequestState::Merged => Err(ExternalError::permanent(
                operation,
                PermanentKind::Rejected,
                format!("#{id} is already merged"),
            )),
            _ => {
                change_request.state = ChangeRequestState::Merged;
                match state.lost_merge_responses.pop_front() {
                    Some(error) => Err(error),
                    None => Ok(Some(format!("mock-merge-{id}"))),
                }
            }
        }
    }

    async fn delete_branch(&self, branch: &str) -> Result<(), ExternalError> {
        let mut state = self.lock();
        if let Some(error) = state.delete_errors.pop_front() {
            return Err(error);
        }
        state.calls.deleted_branches.push(branch.to_string());
        Ok(())
    }
}
