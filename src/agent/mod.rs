//! Agent definitions and lookup

pub mod registry;

pub use registry::{AgentRegistry, FileAgentRegistry, InMemoryAgentRegistry};

use crate::error::{ErrorCode, SwarmError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

const MAX_AGENT_NAME_LEN: usize = 64;
const TEMPLATE_PREFIX: &str = "templates/";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent not found: {0}")]
    NotFound(String),

    #[error("Invalid agent definition '{name}': {reason}")]
    Invalid { name: String, reason: String },

    #[error("Invalid agent reference '{0}'")]
    InvalidReference(String),

    #[error("Failed to read agent definitions at {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse agent definition {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

impl From<AgentError> for SwarmError {
    fn from(err: AgentError) -> Self {
        let error = match &err {
            AgentError::NotFound(name) => SwarmError::execution_with_code(
                ErrorCode::EXEC_AGENT_NOT_FOUND,
                err.to_string(),
                Some(name.clone()),
            ),
            AgentError::Invalid { .. } | AgentError::InvalidReference(_) => {
                SwarmError::config_with_code(ErrorCode::CONFIG_INVALID_VALUE, err.to_string())
            }
            AgentError::Load { .. } | AgentError::Parse { .. } => {
                SwarmError::config_with_code(ErrorCode::CONFIG_PARSE_ERROR, err.to_string())
            }
        };
        error.with_source(err)
    }
}

/// A registered agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDefinition {
    pub name: String,
    pub version: semver::Version,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Interpreter prepended to `entry`, e.g. `python3`
    #[serde(default)]
    pub runtime: Option<String>,
    /// Entry command line, relative to `code_dir`
    pub entry: String,
    pub code_dir: PathBuf,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Exported to the agent as `SWARM_MEMORY_MB`
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub input_schema: Option<Value>,
    #[serde(default)]
    pub output_schema: Option<Value>,
}

fn default_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_memory_mb() -> u32 {
    512
}

impl AgentDefinition {
    /// Command line that starts the agent
    pub fn command_argv(&self) -> Result<Vec<String>, AgentError> {
        let mut argv = Vec::new();
        if let Some(runtime) = &self.runtime {
            argv.extend(self.split(runtime)?);
        }
        argv.extend(self.split(&self.entry)?);
        if argv.is_empty() {
            return Err(AgentError::Invalid {
                name: self.name.clone(),
                reason: "empty entry command".to_string(),
            });
        }
        Ok(argv)
    }

    fn split(&self, line: &str) -> Result<Vec<String>, AgentError> {
        shell_words::split(line).map_err(|e| AgentError::Invalid {
            name: self.name.clone(),
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        let invalid = |reason: &str| AgentError::Invalid {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name is empty"));
        }
        if self.timeout.is_zero() {
            return Err(invalid("timeout must be positive"));
        }
        self.command_argv()?;
        Ok(())
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// A step's agent reference: `name` or `name@version`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentRef {
    pub name: String,
    pub version: Option<semver::Version>,
}

impl AgentRef {
    pub fn parse(reference: &str) -> Result<Self, AgentError> {
        let reference = reference.trim();
        let (name, version) = match reference.rsplit_once('@') {
            Some((name, version)) => {
                let version = semver::Version::parse(version)
                    .map_err(|_| AgentError::InvalidReference(reference.to_string()))?;
                (name, Some(version))
            }
            None => (reference, None),
        };
        if name.is_empty() {
            return Err(AgentError::InvalidReference(reference.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            version,
        })
    }

    /// The other spelling of this name: with or without the `templates/` prefix
    pub fn template_form(&self) -> String {
        match self.name.strip_prefix(TEMPLATE_PREFIX) {
            Some(stripped) => stripped.to_string(),
            None => format!("{}{}", TEMPLATE_PREFIX, self.name),
        }
    }
}

impl fmt::Display for AgentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{}", self.name, version),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Restrict an agent name to `[A-Za-z0-9_-]` for use in remote commands
pub fn sanitize_agent_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_AGENT_NAME_LEN)
        .collect()
}
