//! Verification gate
//!
//! After an attempt produces a change, an external judge classifies it in
//! phases. The types here carry the judge's verdict, turn it into feedback for
//! the next attempt and decide between retrying and escalating.

pub mod feedback;
pub mod judge;
pub mod merge;

pub use feedback::{feedback_record, format_feedback, instructions_from, rejection_from_failure};
pub use judge::{verify_with_retries, HttpJudge, Judge, JudgeError};
pub use merge::{GhMerger, MergeError, MergeOutcome, PullRequestMerger, PullRequestRef};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const SENTINEL_PHASE: &str = "sentinel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Passed,
    Failed,
    Skipped,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationStatus::Passed => "passed",
            VerificationStatus::Failed => "failed",
            VerificationStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseOutcome {
    pub phase: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// The judge's verdict
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationResult {
    pub status: VerificationStatus,
    #[serde(default)]
    pub phases: Vec<PhaseOutcome>,
    /// Instructions addressed to the agent on the next attempt
    #[serde(default)]
    pub feedback_for_agent: Vec<String>,
    /// Raw structured feedback
    #[serde(default)]
    pub feedback: Value,
}

impl VerificationResult {
    pub fn passed() -> Self {
        Self {
            status: VerificationStatus::Passed,
            phases: Vec::new(),
            feedback_for_agent: Vec::new(),
            feedback: Value::Null,
        }
    }

    pub fn failed<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            status: VerificationStatus::Failed,
            phases: Vec::new(),
            feedback_for_agent: lines.into_iter().map(Into::into).collect(),
            feedback: Value::Null,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: VerificationStatus::Skipped,
            ..Self::passed()
        }
    }

    /// Skipped verification counts as a pass
    pub fn is_pass(&self) -> bool {
        matches!(
            self.status,
            VerificationStatus::Passed | VerificationStatus::Skipped
        )
    }

    pub fn failed_phases(&self) -> impl Iterator<Item = &str> {
        self.phases
            .iter()
            .filter(|p| !p.passed)
            .map(|p| p.phase.as_str())
    }
}

/// Body sent to the judge
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRequest {
    pub ticket_id: String,
    pub branch_name: String,
    pub repo_url: Option<String>,
    pub attempt: u32,
    pub acceptance_criteria: Vec<String>,
    pub phases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerificationConfig {
    /// Judge endpoint; verification is skipped for every ticket when unset
    pub judge_url: Option<String>,
    #[serde(with = "humantime_serde")]
    pub judge_timeout: Duration,
    /// Extra calls after a judge infrastructure error
    pub judge_retries: u32,
    #[serde(with = "humantime_serde")]
    pub judge_retry_delay: Duration,
    pub phases: Vec<String>,
    pub retry: RetryPolicy,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            judge_url: None,
            judge_timeout: Duration::from_secs(300),
            judge_retries: 2,
            judge_retry_delay: Duration::from_secs(2),
            phases: vec!["static".into(), "tests".into(), "review".into()],
            retry: RetryPolicy::default(),
        }
    }
}

/// Bounded retry after a rejection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    pub multiplier: f64,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_delay: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        retry_count: u32,
        after: DateTime<Utc>,
    },
    Hold {
        retry_count: u32,
    },
}

impl RetryPolicy {
    /// Delay before attempt `retry_count + 1`
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Outcome of one more rejection on a ticket that has `previous_retries`
    pub fn decide(&self, previous_retries: u32, now: DateTime<Utc>) -> RetryDecision {
        let retry_count = previous_retries + 1;
        if retry_count < self.max_attempts {
            let delay = chrono::Duration::from_std(self.backoff(retry_count))
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
            RetryDecision::Retry {
                retry_count,
                after: now + delay,
            }
        } else {
            RetryDecision::Hold { retry_count }
        }
    }
}
