use serde_json::{json, Value};
use std::fmt::Display;
use thiserror::Error;

pub mod codes;

pub use codes::{describe_error_code, ErrorCode};

/// The unified error type for the engine
///
/// Module errors (`ProcessError`, `LeaseError`, `ExecutorError`, ...) convert
/// into this type so the engine can classify a failure and record it on the
/// ticket as evidence.
#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("[E{code:04}] Configuration error: {message}")]
    Config {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Work store error: {message}")]
    Store {
        code: u16,
        message: String,
        ticket_id: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Lease error: {message}")]
    Lease {
        code: u16,
        message: String,
        slot: Option<u32>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Execution error: {message}")]
    Execution {
        code: u16,
        message: String,
        command: Option<String>,
        exit_code: Option<i32>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Workflow error: {message}")]
    Workflow {
        code: u16,
        message: String,
        step: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] Verification error: {message}")]
    Verification {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("[E{code:04}] {message}")]
    Other {
        code: u16,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl SwarmError {
    /// Create a configuration error with default code
    pub fn config(message: impl Into<String>) -> Self {
        Self::config_with_code(ErrorCode::CONFIG_GENERIC, message)
    }

    /// Create a configuration error with specific code
    pub fn config_with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Config {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create a work store error with specific code and ticket
    pub fn store_with_code(
        code: u16,
        message: impl Into<String>,
        ticket_id: Option<String>,
    ) -> Self {
        Self::Store {
            code,
            message: message.into(),
            ticket_id,
            source: None,
        }
    }

    /// Create a lease error with specific code and slot
    pub fn lease_with_code(code: u16, message: impl Into<String>, slot: Option<u32>) -> Self {
        Self::Lease {
            code,
            message: message.into(),
            slot,
            source: None,
        }
    }

    /// Create an execution error with default code
    pub fn execution(message: impl Into<String>) -> Self {
        Self::execution_with_code(ErrorCode::EXEC_GENERIC, message, None)
    }

    /// Create an execution error with specific code
    pub fn execution_with_code(
        code: u16,
        message: impl Into<String>,
        command: Option<String>,
    ) -> Self {
        Self::Execution {
            code,
            message: message.into(),
            command,
            exit_code: None,
            source: None,
        }
    }

    /// Create a workflow error with specific code
    pub fn workflow_with_code(code: u16, message: impl Into<String>, step: Option<String>) -> Self {
        Self::Workflow {
            code,
            message: message.into(),
            step,
            source: None,
        }
    }

    /// Create a verification error with specific code
    pub fn verification_with_code(code: u16, message: impl Into<String>) -> Self {
        Self::Verification {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create a generic other error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            code: ErrorCode::OTHER_GENERIC,
            message: message.into(),
            source: None,
        }
    }

    /// Add a source error to this error
    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        match &mut self {
            Self::Config { source: src, .. }
            | Self::Store { source: src, .. }
            | Self::Lease { source: src, .. }
            | Self::Execution { source: src, .. }
            | Self::Workflow { source: src, .. }
            | Self::Verification { source: src, .. }
            | Self::Other { source: src, .. } => {
                *src = Some(source.into());
            }
        }
        self
    }

    /// Add context to the error message
    pub fn with_context(mut self, context: impl Display) -> Self {
        match &mut self {
            Self::Config { message, .. }
            | Self::Store { message, .. }
            | Self::Lease { message, .. }
            | Self::Execution { message, .. }
            | Self::Workflow { message, .. }
            | Self::Verification { message, .. }
            | Self::Other { message, .. } => {
                *message = format!("{}: {}", context, message);
            }
        }
        self
    }

    /// Set the exit code for an execution error
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        if let Self::Execution {
            exit_code: ref mut ec,
            ..
        } = self
        {
            *ec = Some(exit_code);
        }
        self
    }

    /// Set the workflow step for a workflow error
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        if let Self::Workflow {
            step: ref mut s, ..
        } = self
        {
            *s = Some(step.into());
        }
        self
    }

    /// Get the error code
    pub fn code(&self) -> u16 {
        match self {
            Self::Config { code, .. }
            | Self::Store { code, .. }
            | Self::Lease { code, .. }
            | Self::Execution { code, .. }
            | Self::Workflow { code, .. }
            | Self::Verification { code, .. }
            | Self::Other { code, .. } => *code,
        }
    }

    /// Short category name used in logs and evidence
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Store { .. } => "store",
            Self::Lease { .. } => "lease",
            Self::Execution { .. } => "execution",
            Self::Workflow { .. } => "workflow",
            Self::Verification { .. } => "verification",
            Self::Other { .. } => "other",
        }
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => 2,
            Self::Store { .. } => 3,
            Self::Lease { .. } => 4,
            Self::Execution { .. } => 5,
            Self::Workflow { .. } => 6,
            Self::Verification { .. } => 7,
            Self::Other { .. } => 1,
        }
    }

    /// Structural errors are detected before any work runs: a malformed
    /// workflow, a dependency cycle or a missing agent definition.
    pub fn is_structural(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::WORKFLOW_INVALID_STEP
                | ErrorCode::WORKFLOW_CIRCULAR_DEPENDENCY
                | ErrorCode::WORKFLOW_UNKNOWN_DEPENDENCY
                | ErrorCode::WORKFLOW_DUPLICATE_STEP
                | ErrorCode::EXEC_AGENT_NOT_FOUND
        ) || matches!(self, Self::Config { .. })
    }

    /// Pool exhaustion is the one lease failure a caller may simply retry later
    pub fn is_retryable(&self) -> bool {
        self.code() == ErrorCode::LEASE_POOL_EXHAUSTED
    }

    /// Structured form persisted as ticket evidence
    pub fn to_evidence(&self) -> Value {
        let mut chain = Vec::new();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        json!({
            "code": self.code(),
            "category": self.category(),
            "description": describe_error_code(self.code()),
            "message": self.to_string(),
            "structural": self.is_structural(),
            "causes": chain,
        })
    }
}

/// Type alias for Results using SwarmError
pub type Result<T> = std::result::Result<T, SwarmError>;
