use super::{VerificationRequest, VerificationResult};
use crate::error::{ErrorCode, SwarmError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("Judge unavailable: {0}")]
    Unavailable(String),

    #[error("Judge call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Judge returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid judge response: {0}")]
    InvalidResponse(String),
}

impl JudgeError {
    /// Whether calling again may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            JudgeError::Unavailable(_) | JudgeError::Timeout(_) => true,
            JudgeError::Status { status, .. } => *status == 429 || *status >= 500,
            JudgeError::InvalidResponse(_) => false,
        }
    }
}

impl From<JudgeError> for SwarmError {
    fn from(err: JudgeError) -> Self {
        let code = match &err {
            JudgeError::Unavailable(_) | JudgeError::Status { .. } => {
                ErrorCode::VERIFY_JUDGE_UNAVAILABLE
            }
            JudgeError::Timeout(_) => ErrorCode::VERIFY_JUDGE_TIMEOUT,
            JudgeError::InvalidResponse(_) => ErrorCode::VERIFY_INVALID_RESPONSE,
        };
        SwarmError::verification_with_code(code, err.to_string()).with_source(err)
    }
}

/// Classifies a produced change
///
/// Calls must be idempotent; the engine repeats them after infrastructure
/// errors.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn verify(&self, request: &VerificationRequest) -> Result<VerificationResult, JudgeError>;
}

/// Judge reached over HTTP: POST the request as JSON, read the verdict back
pub struct HttpJudge {
    client: Client,
    url: String,
    timeout: Duration,
}

impl HttpJudge {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, JudgeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| JudgeError::Unavailable(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Judge for HttpJudge {
    async fn verify(&self, request: &VerificationRequest) -> Result<VerificationResult, JudgeError> {
        debug!(
            "Verifying ticket {} attempt {} via {}",
            request.ticket_id, request.attempt, self.url
        );
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    JudgeError::Timeout(self.timeout)
                } else {
                    JudgeError::Unavailable(e.to_string())
                }
            })?;

        match response.status() {
            StatusCode::OK => response
                .json::<VerificationResult>()
                .await
                .map_err(|e| JudgeError::InvalidResponse(e.to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(JudgeError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

/// Call the judge, repeating retryable failures up to `retries` more times
pub async fn verify_with_retries(
    judge: &dyn Judge,
    request: &VerificationRequest,
    retries: u32,
    delay: Duration,
) -> Result<VerificationResult, JudgeError> {
    let mut attempt = 0;
    loop {
        match judge.verify(request).await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                warn!(
                    "Judge call for {} failed ({}), retrying {}/{}",
                    request.ticket_id, e, attempt, retries
                );
                sleep(delay * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}
