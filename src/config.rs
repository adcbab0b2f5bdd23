use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::ci_monitor::PartialTimeoutPolicy;
use crate::pipeline::{PipelineSettings, RetryPolicy};
use crate::review::decision::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::vcs::github::DEFAULT_API_URL;
use crate::vcs::MergeStrategy;

pub const CONFIG_FILE: &str = ".release-pipeline.toml";
pub const STATUS_FILE: &str = ".release-pipeline-status.json";

/// Upper bound on `merge.max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {var}: {value:?}")]
    InvalidOverride { var: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration loaded from .release-pipeline.toml.
///
/// Every section is optional; an empty file (or none) gives the documented
/// defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub github: GitHubConfig,

    #[serde(default)]
    pub review: ReviewConfig,

    #[serde(default)]
    pub ci: CiConfig,

    #[serde(default)]
    pub merge: MergeConfig,

    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Work item id -> ids it waits on
    #[serde(default)]
    pub dependencies: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// GitHub API token. If None, falls back to GITHUB_TOKEN env var.
    pub token: Option<String>,
    pub api_url: String,
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_url: DEFAULT_API_URL.to_string(),
            owner: None,
            repo: None,
            request_timeout_secs: 30,
        }
    }
}

impl GitHubConfig {
    /// `owner/repo`, when both are configured.
    pub fn repository(&self) -> Option<String> {
        match (&self.owner, &self.repo) {
            (Some(owner), Some(repo)) => Some(format!("{owner}/{repo}")),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    pub confidence_threshold: f64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CiConfig {
    pub poll_interval_secs: u64,
    pub max_wait_secs: u64,
    pub partial_timeout_policy: PartialTimeoutPolicy,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            max_wait_secs: 30 * 60,
            partial_timeout_policy: PartialTimeoutPolicy::Escalate,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub strategy: MergeStrategy,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub attempt_timeout_secs: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::Squash,
            max_retries: 2,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            attempt_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Directory holding one git worktree per work item. Cleanup is skipped
    /// when unset.
    pub worktree_root: Option<PathBuf>,
    /// JSON record of released work items, shared by every `release` run
    pub status_file: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            worktree_root: None,
            status_file: PathBuf::from(STATUS_FILE),
        }
    }
}

impl Config {
    /// Load configuration from .release-pipeline.toml in the current
    /// directory, then apply environment overrides and validate.
    /// Returns the defaults if the file doesn't exist.
    pub fn load() -> Result<Config, ConfigError> {
        let path = Path::new(CONFIG_FILE);
        let mut config = if path.exists() {
            Self::load_from(path)?
        } else {
            Config::default()
        };

        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific path (useful for testing). No overrides are
    /// applied.
    pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Apply `GITHUB_TOKEN` and the `PIPELINE_*` overrides, reading
    /// variables through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.github.token.is_none() {
            self.github.token = lookup("GITHUB_TOKEN");
        }
        if let Some(v) = parse_override(&lookup, "PIPELINE_CONFIDENCE_THRESHOLD")? {
            self.review.confidence_threshold = v;
        }
        if let Some(v) = parse_override(&lookup, "PIPELINE_CI_POLL_INTERVAL_SECS")? {
            self.ci.poll_interval_secs = v;
        }
        if let Some(v) = parse_override(&lookup, "PIPELINE_CI_MAX_WAIT_SECS")? {
            self.ci.max_wait_secs = v;
        }
        if let Some(v) = parse_override(&lookup, "PIPELINE_MERGE_MAX_RETRIES")? {
            self.merge.max_retries = v;
        }
        if let Some(v) = parse_override(&lookup, "PIPELINE_STATUS_FILE")? {
            self.workspace.status_file = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.review.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "review.confidence_threshold must be within 0..=1, got {threshold}"
            )));
        }
        if self.ci.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("ci.poll_interval_secs must be positive".into()));
        }
        if self.ci.max_wait_secs < self.ci.poll_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "ci.max_wait_secs ({}) is shorter than ci.poll_interval_secs ({})",
                self.ci.max_wait_secs, self.ci.poll_interval_secs
            )));
        }
        if self.merge.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "merge.max_retries must be at most {MAX_RETRIES_LIMIT}, got {}",
                self.merge.max_retries
            )));
        }
        if self.merge.attempt_timeout_secs == 0 || self.github.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "external call timeouts must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the GitHub token: config file value takes precedence,
    /// falls back to GITHUB_TOKEN env var.
    pub fn github_token(&self) -> Option<String> {
        self.github
            .token
            .clone()
            .or_else(|| std::env::var("GITHUB_TOKEN").ok())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.merge.max_retries,
            base_delay: Duration::from_millis(self.merge.backoff_base_ms),
            max_delay: Duration::from_millis(self.merge.backoff_max_ms),
            attempt_timeout: Duration::from_secs(self.merge.attempt_timeout_secs),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            confidence_threshold: self.review.confidence_threshold,
            poll_interval: Duration::from_secs(self.ci.poll_interval_secs),
            max_ci_wait: Duration::from_secs(self.ci.max_wait_secs),
            partial_timeout_policy: self.ci.partial_timeout_policy,
            merge_strategy: self.merge.strategy,
            retry: self.retry_policy(),
            ..PipelineSettings::default()
        }
    }
}

fn parse_override<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidOverride { var, value }),
    }
}
