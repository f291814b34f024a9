//! Pull request merge after sentinel approval

use crate::error::{ErrorCode, SwarmError};
use crate::subprocess::{ProcessCommandBuilder, ProcessError, ProcessRunner};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

static PR_URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"github\.com/([^/]+)/([^/]+)/pull/(\d+)").expect("valid pull request regex")
});

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("Invalid PR URL: {0}")]
    InvalidUrl(String),

    #[error("Merge of {pr} failed: {message}")]
    Failed { pr: String, message: String },

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl From<MergeError> for SwarmError {
    fn from(err: MergeError) -> Self {
        SwarmError::verification_with_code(ErrorCode::VERIFY_MERGE_FAILED, err.to_string())
            .with_source(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl PullRequestRef {
    pub fn parse(url: &str) -> Result<Self, MergeError> {
        let caps = PR_URL_REGEX
            .captures(url)
            .ok_or_else(|| MergeError::InvalidUrl(url.to_string()))?;
        let number = caps[3]
            .parse()
            .map_err(|_| MergeError::InvalidUrl(url.to_string()))?;
        Ok(Self {
            owner: caps[1].to_string(),
            repo: caps[2].to_string(),
            number,
        })
    }

    pub fn full_repo(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    AlreadyMerged,
}

#[async_trait]
pub trait PullRequestMerger: Send + Sync {
    async fn merge(&self, pr_url: &str) -> Result<MergeOutcome, MergeError>;
}

/// Squash-merges through the GitHub CLI
pub struct GhMerger {
    runner: Arc<dyn ProcessRunner>,
    timeout: Duration,
    token: Option<String>,
}

impl GhMerger {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            timeout: Duration::from_secs(60),
            token: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Passed to `gh` as `GH_TOKEN`
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

#[async_trait]
impl PullRequestMerger for GhMerger {
    async fn merge(&self, pr_url: &str) -> Result<MergeOutcome, MergeError> {
        let pr = PullRequestRef::parse(pr_url)?;
        info!("Merging PR #{} in {}", pr.number, pr.full_repo());

        let mut builder = ProcessCommandBuilder::new("gh")
            .args(["pr", "merge"])
            .arg(&pr.number.to_string())
            .args(["--repo", &pr.full_repo(), "--squash", "--delete-branch"])
            .timeout(self.timeout);
        if let Some(token) = &self.token {
            builder = builder.env("GH_TOKEN", token);
        }

        let output = self.runner.run(builder.build()).await?;
        if output.status.success() {
            return Ok(MergeOutcome::Merged);
        }
        if output.stderr.contains("already been merged") || output.stdout.contains("already been merged") {
            info!("PR #{} was already merged", pr.number);
            return Ok(MergeOutcome::AlreadyMerged);
        }
        Err(MergeError::Failed {
            pr: pr_url.to_string(),
            message: output.stderr_tail(2000).trim().to_string(),
        })
    }
}
