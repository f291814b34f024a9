//! Testing utilities and fixtures
//!
//! Stand-ins for the engine's external collaborators: an in-memory environment
//! driver, a judge that replays scripted verdicts and a merger that records
//! what it was asked to merge. Used by the unit tests and by `tests/`.

pub mod driver;
pub mod fixtures;

pub use driver::{exec_failure, exec_success, ExecHandler, ExecRequest, MockEnvironmentDriver};
pub use fixtures::{agent_definition, run_until_settled, shell_agent, TestHarness};

use crate::verification::{
    Judge, JudgeError, MergeError, MergeOutcome, PullRequestMerger, VerificationRequest,
    VerificationResult,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

enum Verdict {
    Result(VerificationResult),
    Unavailable(String),
}

/// Judge that returns queued verdicts in order, then passes everything
#[derive(Clone, Default)]
pub struct ScriptedJudge {
    verdicts: Arc<Mutex<VecDeque<Verdict>>>,
    requests: Arc<Mutex<Vec<VerificationRequest>>>,
}

impl ScriptedJudge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_pass(self) -> Self {
        self.push(Verdict::Result(VerificationResult::passed()))
    }

    pub fn then_reject<I, S>(self, feedback: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(Verdict::Result(VerificationResult::failed(feedback)))
    }

    pub fn then_result(self, result: VerificationResult) -> Self {
        self.push(Verdict::Result(result))
    }

    /// One infrastructure failure
    pub fn then_unavailable(self, message: &str) -> Self {
        self.push(Verdict::Unavailable(message.to_string()))
    }

    fn push(self, verdict: Verdict) -> Self {
        self.verdicts.lock().unwrap().push_back(verdict);
        self
    }

    pub fn requests(&self) -> Vec<VerificationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Judge for ScriptedJudge {
    async fn verify(&self, request: &VerificationRequest) -> Result<VerificationResult, JudgeError> {
        self.requests.lock().unwrap().push(request.clone());
        match self.verdicts.lock().unwrap().pop_front() {
            Some(Verdict::Result(result)) => Ok(result),
            Some(Verdict::Unavailable(message)) => Err(JudgeError::Unavailable(message)),
            None => Ok(VerificationResult::passed()),
        }
    }
}

/// Merger that records pull request URLs
#[derive(Clone, Default)]
pub struct RecordingMerger {
    merged: Arc<Mutex<Vec<String>>>,
    failure: Option<String>,
}

impl RecordingMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every merge fails with `message`
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn merged(&self) -> Vec<String> {
        self.merged.lock().unwrap().clone()
    }
}

#[async_trait]
impl PullRequestMerger for RecordingMerger {
    async fn merge(&self, pr_url: &str) -> Result<MergeOutcome, MergeError> {
        self.merged.lock().unwrap().push(pr_url.to_string());
        match &self.failure {
            Some(message) => Err(MergeError::Failed {
                pr: pr_url.to_string(),
                message: message.clone(),
            }),
            None => Ok(MergeOutcome::Merged),
        }
    }
}
