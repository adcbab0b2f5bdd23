use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::types::{
    ChangeRequest, ChangeRequestSpec, ChangeRequestState, CheckConclusion, CheckRun, CheckStatus,
    CiStatusSnapshot, ExternalError, MergeStrategy, PermanentKind,
};
use super::VersionControlHost;

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const CHECK_RUNS_PER_PAGE: usize = 100;

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("Failed to build GitHub client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("Invalid repository reference: {0}")]
    InvalidRepo(String),

    #[error("GitHub token not found in config or environment")]
    MissingToken,
}

/// Owner and name of a GitHub repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

/// Parse `owner/repo` or `https://github.com/owner/repo[/...]`.
pub fn parse_repo(input: &str) -> Result<RepoRef, GitHubError> {
    let invalid = || GitHubError::InvalidRepo(input.to_string());

    let segments: Vec<String> = if input.contains("://") {
        let parsed = reqwest::Url::parse(input).map_err(|_| invalid())?;
        if parsed.host_str() != Some("github.com") {
            return Err(invalid());
        }
        parsed
            .path_segments()
            .ok_or_else(invalid)?
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect()
    } else {
        input
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect()
    };

    if segments.len() < 2 || (!input.contains("://") && segments.len() != 2) {
        return Err(invalid());
    }

    Ok(RepoRef {
        owner: segments[0].clone(),
        repo: segments[1].trim_end_matches(".git").to_string(),
    })
}

/// [`VersionControlHost`] backed by the GitHub REST API.
pub struct GitHubHost {
    client: reqwest::Client,
    api_url: String,
    repo: RepoRef,
    token: String,
    request_timeout: Duration,
}

impl GitHubHost {
    pub fn new(
        repo: RepoRef,
        token: String,
        api_url: &str,
        request_timeout: Duration,
    ) -> Result<Self, GitHubError> {
        let client = reqwest::Client::builder()
            .user_agent("release-pipeline")
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            repo,
            token,
            request_timeout,
        })
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_url, self.repo.owner, self.repo.repo, path
        )
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> Result<Response, ExternalError> {
        let response = request
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| self.request_error(operation, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();
        debug!(%status, operation, "GitHub returned an error status");
        Err(classify_status(operation, status, &headers, &body))
    }

    async fn json<T: DeserializeOwned>(&self, operation: &str, response: Response) -> Result<T, ExternalError> {
        response
            .json::<T>()
            .await
            .map_err(|e| self.request_error(operation, e))
    }

    fn request_error(&self, operation: &str, err: reqwest::Error) -> ExternalError {
        if err.is_timeout() {
            ExternalError::Timeout {
                operation: operation.to_string(),
                limit: self.request_timeout,
            }
        } else if err.is_decode() {
            ExternalError::permanent(operation, PermanentKind::Rejected, err.to_string())
        } else {
            ExternalError::transient(operation, err.to_string())
        }
    }

    async fn fetch_pull(&self, id: u64) -> Result<PullResponse, ExternalError> {
        let operation = "fetch change request";
        let response = self
            .send(operation, self.client.get(self.repo_url(&format!("pulls/{id}"))))
            .await?;
        self.json(operation, response).await
    }

    /// Labels and reviewers are best effort; only transient failures abort.
    async fn decorate(&self, id: u64, spec: &ChangeRequestSpec) -> Result<(), ExternalError> {
        if !spec.labels.is_empty() {
            let request = self
                .client
                .post(self.repo_url(&format!("issues/{id}/labels")))
                .json(&serde_json::json!({ "labels": spec.labels }));
            match self.send("add labels", request).await {
                Ok(_) => {}
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => warn!(error = %e, "could not label change request"),
            }
        }
        if !spec.reviewers.is_empty() {
            let request = self
                .client
                .post(self.repo_url(&format!("pulls/{id}/requested_reviewers")))
                .json(&serde_json::json!({ "reviewers": spec.reviewers }));
            match self.send("request reviewers", request).await {
                Ok(_) => {}
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => warn!(error = %e, "could not request reviewers"),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct BranchRef {
    #[serde(rename = "ref")]
    name: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct Label {
    name: String,
}

#[derive(Debug, Deserialize)]
struct User {
    login: String,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    number: u64,
    title: String,
    body: Option<String>,
    state: String,
    merged_at: Option<String>,
    head: BranchRef,
    base: BranchRef,
    #[serde(default)]
    labels: Vec<Label>,
    #[serde(default)]
    requested_reviewers: Vec<User>,
}

impl From<PullResponse> for ChangeRequest {
    fn from(pull: PullResponse) -> Self {
        let state = match (pull.state.as_str(), pull.merged_at.is_some()) {
            (_, true) => ChangeRequestState::Merged,
            ("closed", false) => ChangeRequestState::Closed,
            _ => ChangeRequestState::Open,
        };
        ChangeRequest {
            id: pull.number,
            source_branch: pull.head.name,
            target_branch: pull.base.name,
            title: pull.title,
            description: pull.body.unwrap_or_default(),
            labels: pull.labels.into_iter().map(|l| l.name).collect(),
            reviewers: pull.requested_reviewers.into_iter().map(|u| u.login).collect(),
            state,
            head_sha: Some(pull.head.sha),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CheckRunResponse {
    name: String,
    status: String,
    conclusion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckRunsResponse {
    #[serde(default)]
    total_count: usize,
    check_runs: Vec<CheckRunResponse>,
}

impl From<CheckRunResponse> for CheckRun {
    fn from(run: CheckRunResponse) -> Self {
        let status = match run.status.as_str() {
            "completed" => CheckStatus::Done,
            "in_progress" => CheckStatus::Running,
            _ => CheckStatus::Pending,
        };
        let conclusion = run.conclusion.as_deref().map(|c| match c {
            "success" => CheckConclusion::Success,
            "neutral" | "skipped" => CheckConclusion::Neutral,
            _ => CheckConclusion::Failure,
        });
        CheckRun {
            name: run.name,
            status,
            conclusion,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MergeResponse {
    sha: Option<String>,
}

/// The open pull request for a branch pair, else the merged one. Pulls
/// closed without merging are ignored.
fn pick_existing(pulls: Vec<PullResponse>) -> Option<PullResponse> {
    let (open, finished): (Vec<_>, Vec<_>) = pulls.into_iter().partition(|p| p.state == "open");
    open.into_iter()
        .next()
        .or_else(|| finished.into_iter().find(|p| p.merged_at.is_some()))
}

/// Whether another page of check runs is needed after one that returned
/// `page_len` runs.
fn has_more_check_runs(page_len: usize, collected: usize, total_count: usize) -> bool {
    page_len == CHECK_RUNS_PER_PAGE && collected < total_count
}

/// Map an HTTP error status to a transient or permanent failure.
fn classify_status(operation: &str, status: StatusCode, headers: &HeaderMap, body: &str) -> ExternalError {
    let rate_limited = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        == Some("0");
    let reason = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());

    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            ExternalError::transient(operation, reason)
        }
        StatusCode::FORBIDDEN if rate_limited => ExternalError::transient(operation, reason),
        s if s.is_server_error() => ExternalError::transient(operation, reason),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ExternalError::permanent(operation, PermanentKind::PermissionDenied, reason)
        }
        StatusCode::NOT_FOUND => ExternalError::permanent(operation, PermanentKind::NotFound, reason),
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::CONFLICT => {
            ExternalError::permanent(operation, PermanentKind::MergeConflict, reason)
        }
        _ => ExternalError::permanent(operation, PermanentKind::Rejected, reason),
    }
}

#[async_trait]
impl VersionControlHost for GitHubHost {
    #[instrument(skip(self, spec), fields(work_item = %spec.work_item, head = %spec.source_branch))]
    async fn create_or_get_change_request(
        &self,
        spec: &ChangeRequestSpec,
    ) -> Result<ChangeRequest, ExternalError> {
        let operation = "create change request";
        let head = format!("{}:{}", self.repo.owner, spec.source_branch);
        let existing = self
            .send(
                operation,
                self.client.get(self.repo_url("pulls")).query(&[
                    ("state", "all"),
                    ("head", head.as_str()),
                    ("base", spec.target_branch.as_str()),
                ]),
            )
            .await?;
        let pulls: Vec<PullResponse> = self.json(operation, existing).await?;

        let pull = match pick_existing(pulls) {
            Some(pull) => pull,
            None => {
                debug!("no open or merged change request, creating one");
                let request = self.client.post(self.repo_url("pulls")).json(&serde_json::json!({
                    "title": spec.title,
                    "head": spec.source_branch,
                    "base": spec.target_branch,
                    "body": spec.description,
                }));
                let created = self.send(operation, request).await?;
                self.json::<PullResponse>(operation, created).await?
            }
        };

        let id = pull.number;
        let mut change_request = ChangeRequest::from(pull);
        if change_request.state.is_terminal() {
            debug!(id, state = %change_request.state, "change request already finished");
            return Ok(change_request);
        }
        self.decorate(id, spec).await?;
        change_request.labels = spec.labels.clone();
        change_request.reviewers = spec.reviewers.clone();
        debug!(id, "change request ready");
        Ok(change_request)
    }

    async fn fetch_change_request(&self, id: u64) -> Result<ChangeRequest, ExternalError> {
        Ok(self.fetch_pull(id).await?.into())
    }

    async fn fetch_ci_status(&self, id: u64) -> Result<CiStatusSnapshot, ExternalError> {
        let operation = "fetch CI status";
        let pull = self.fetch_pull(id).await?;
        let url = self.repo_url(&format!("commits/{}/check-runs", pull.head.sha));

        let mut checks = Vec::new();
        for page in 1u32.. {
            let response = self
                .send(
                    operation,
                    self.client
                        .get(&url)
                        .query(&[("per_page", CHECK_RUNS_PER_PAGE.to_string()), ("page", page.to_string())]),
                )
                .await?;
            let runs: CheckRunsResponse = self.json(operation, response).await?;
            let fetched = runs.check_runs.len();
            checks.extend(runs.check_runs.into_iter().map(CheckRun::from));
            if !has_more_check_runs(fetched, checks.len(), runs.total_count) {
                break;
            }
            debug!(page, fetched = checks.len(), total = runs.total_count, "fetching next page of check runs");
        }
        Ok(CiStatusSnapshot::new(checks))
    }

    #[instrument(skip(self))]
    async fn merge_change_request(
        &self,
        id: u64,
        strategy: MergeStrategy,
    ) -> Result<Option<String>, ExternalError> {
        let operation = "merge change request";
        let request = self
            .client
            .put(self.repo_url(&format!("pulls/{id}/merge")))
            .json(&serde_json::json!({ "merge_method": strategy.as_str() }));
        let response = self.send(operation, request).await?;
        let merged: MergeResponse = self.json(operation, response).await?;
        Ok(merged.sha)
    }

    #[instrument(skip(self))]
    async fn delete_branch(&self, branch: &str) -> Result<(), ExternalError> {
        let request = self
            .client
            .delete(self.repo_url(&format!("git/refs/heads/{branch}")));
        match self.send("delete branch", request).await {
            Ok(_) => Ok(()),
            // Already gone counts as deleted.
            Err(e)
                if matches!(
                    e.permanent_kind(),
                    Some(PermanentKind::NotFound) | Some(PermanentKind::Rejected)
                ) =>
            {
                debug!(branch, "branch already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repo_slug() {
        let repo = parse_repo("org/repo").unwrap();
        assert_eq!(repo.owner, "org");
        assert_eq!(repo.repo, "repo");
    }

    #[test]
    fn test_parse_repo_url() {
        let repo = parse_repo("https://github.com/org/repo.git").unwrap();
        assert_eq!(repo, RepoRef { owner: "org".into(), repo: "repo".into() });
        let repo = parse_repo("https://github.com/org/repo/pull/42").unwrap();
        assert_eq!(repo.repo, "repo");
    }

    #[test]
    fn test_parse_repo_invalid() {
        assert!(parse_repo("https://example.com/org/repo").is_err());
        assert!(parse_repo("just-a-name").is_err());
        assert!(parse_repo("a/b/c").is_err());
        assert!(parse_repo("https://github.com/org").is_err());
    }

    #[test]
    fn test_classify_transient_statuses() {
        let headers = HeaderMap::new();
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::REQUEST_TIMEOUT,
        ] {
            assert!(classify_status("merge", status, &headers, "").is_transient(), "{status}");
        }
    }

    #[test]
    fn test_classify_rate_limited_forbidden_is_transient() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", "0".parse().unwrap());
        assert!(classify_status("merge", StatusCode::FORBIDDEN, &headers, "").is_transient());
        let plain = classify_status("merge", StatusCode::FORBIDDEN, &HeaderMap::new(), "");
        assert_eq!(plain.permanent_kind(), Some(PermanentKind::PermissionDenied));
    }

    #[test]
    fn test_classify_merge_conflict() {
        let err = classify_status(
            "merge",
            StatusCode::METHOD_NOT_ALLOWED,
            &HeaderMap::new(),
            "Pull Request is not mergeable",
        );
        assert_eq!(err.permanent_kind(), Some(PermanentKind::MergeConflict));
        assert!(err.to_string().contains("not mergeable"));
    }

    #[test]
    fn test_check_run_mapping() {
        let parsed: CheckRunsResponse = serde_json::from_str(
            r#"{"check_runs": [
                {"name": "build", "status": "completed", "conclusion": "success"},
                {"name": "lint", "status": "completed", "conclusion": "skipped"},
                {"name": "e2e", "status": "in_progress", "conclusion": null},
                {"name": "deploy", "status": "queued", "conclusion": null},
                {"name": "flaky", "status": "completed", "conclusion": "timed_out"}
            ]}"#,
        )
        .unwrap();
        let runs: Vec<CheckRun> = parsed.check_runs.into_iter().map(CheckRun::from).collect();
        assert_eq!(runs[0].conclusion, Some(CheckConclusion::Success));
        assert_eq!(runs[1].conclusion, Some(CheckConclusion::Neutral));
        assert_eq!(runs[2].status, CheckStatus::Running);
        assert_eq!(runs[3].status, CheckStatus::Pending);
        assert_eq!(runs[4].conclusion, Some(CheckConclusion::Failure));
    }

    #[test]
    fn test_check_run_paging() {
        assert!(has_more_check_runs(100, 100, 130));
        assert!(!has_more_check_runs(30, 130, 130));
        assert!(!has_more_check_runs(100, 100, 100));
        assert!(!has_more_check_runs(0, 100, 130));

        let parsed: CheckRunsResponse =
            serde_json::from_str(r#"{"total_count": 130, "check_runs": []}"#).unwrap();
        assert_eq!(parsed.total_count, 130);
    }

    fn pull(number: u64, state: &str, merged: bool) -> PullResponse {
        let merged_at = merged.then_some("2026-01-01T00:00:00Z");
        serde_json::from_value(serde_json::json!({
            "number": number,
            "title": "S-1",
            "body": null,
            "state": state,
            "merged_at": merged_at,
            "head": {"ref": "story/S-1", "sha": "abc"},
            "base": {"ref": "main", "sha": "def"},
        }))
        .unwrap()
    }

    #[test]
    fn test_existing_pull_prefers_open_then_merged() {
        let picked = pick_existing(vec![pull(3, "closed", true), pull(7, "open", false)]).unwrap();
        assert_eq!(picked.number, 7);

        let picked = pick_existing(vec![pull(2, "closed", false), pull(3, "closed", true)]).unwrap();
        assert_eq!(ChangeRequest::from(picked).state, ChangeRequestState::Merged);

        assert!(pick_existing(vec![pull(2, "closed", false)]).is_none());
        assert!(pick_existing(Vec::new()).is_none());
    }

    #[test]
    fn test_pull_state_mapping() {
        let pull: PullResponse = serde_json::from_str(
            r#"{"number": 42, "title": "S-1", "body": null, "state": "closed",
                "merged_at": "2026-01-01T00:00:00Z",
                "head": {"ref": "story/S-1", "sha": "abc"},
                "base": {"ref": "main", "sha": "def"},
                "labels": [{"name": "auto-merge"}]}"#,
        )
        .unwrap();
        let cr = ChangeRequest::from(pull);
        assert_eq!(cr.state, ChangeRequestState::Merged);
        assert_eq!(cr.source_branch, "story/S-1");
        assert_eq!(cr.head_sha.as_deref(), Some("abc"));
        assert_eq!(cr.labels, vec!["auto-merge".to_string()]);
    }
}
