//! Engine settings: TOML file first, then environment overrides

use crate::engine::EngineConfig;
use crate::error::{ErrorCode, SwarmError};
use crate::executor::ExecutorConfig;
use crate::lease::LeaseConfig;
use crate::store::PostgresConfig;
use crate::verification::VerificationConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Process-level options from the command line
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// Verbosity level for logging
    pub verbose: u8,
    /// Also write logs to `<log_dir>/swarm-engine.log`
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn new(verbose: u8) -> Self {
        Self {
            verbose,
            log_dir: None,
        }
    }

    pub fn with_log_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.log_dir = dir;
        self
    }

    /// Get the log level string based on verbosity
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            2 => "trace",
            _ => "trace,hyper=debug,reqwest=debug,sqlx=debug",
        }
    }
}

fn default_agents_dir() -> PathBuf {
    PathBuf::from("agents")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSettings {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    /// An empty URL selects the in-memory store
    #[serde(default)]
    pub database: PostgresConfig,
    /// Directory of agent definition YAML files
    #[serde(default = "default_agents_dir")]
    pub agents_dir: PathBuf,
    /// YAML ticket list loaded into the in-memory store
    #[serde(default)]
    pub tickets: Option<PathBuf>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    /// Exposed to step inputs as `${config.*}`
    #[serde(default)]
    pub variables: toml::Table,
    /// Environment variables exposed to step inputs as `${secrets.*}`
    #[serde(default)]
    pub secret_env: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            lease: LeaseConfig::default(),
            executor: ExecutorConfig::default(),
            verification: VerificationConfig::default(),
            database: PostgresConfig::default(),
            agents_dir: default_agents_dir(),
            tickets: None,
            log_dir: None,
            pid_file: None,
            variables: toml::Table::new(),
            secret_env: Vec::new(),
        }
    }
}

impl EngineSettings {
    /// Settings from `path` (defaults when `None`) with the process
    /// environment applied on top
    pub fn load(path: Option<&Path>) -> Result<Self, SwarmError> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, SwarmError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SwarmError::config_with_code(
                ErrorCode::CONFIG_NOT_FOUND,
                format!("cannot read {}: {}", path.display(), e),
            )
        })?;
        Self::from_toml(&text)
            .map_err(|e| e.with_context(format!("while loading {}", path.display())))
    }

    pub fn from_toml(text: &str) -> Result<Self, SwarmError> {
        toml::from_str(text).map_err(|e| {
            SwarmError::config_with_code(ErrorCode::CONFIG_PARSE_ERROR, e.to_string())
        })
    }

    /// Apply `SWARM_*` overrides read through `var`
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), SwarmError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = var("SWARM_DATABASE_URL").or_else(|| var("DATABASE_URL")) {
            debug!("Database URL taken from the environment");
            self.database.url = url;
        }
        if let Some(value) = var("SWARM_MAX_CONCURRENT") {
            self.engine.max_concurrent = parse_env("SWARM_MAX_CONCURRENT", &value)?;
        }
        if let Some(value) = var("SWARM_POLL_INTERVAL_MS") {
            let millis: u64 = parse_env("SWARM_POLL_INTERVAL_MS", &value)?;
            self.engine.poll_interval = Duration::from_millis(millis);
        }
        if let Some(dir) = var("SWARM_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = var("SWARM_PID_FILE") {
            self.pid_file = Some(PathBuf::from(path));
        }
        if let Some(url) = var("SWARM_JUDGE_URL") {
            self.verification.judge_url = Some(url);
        }
        if self.engine.sentinel.github_token.is_none() {
            self.engine.sentinel.github_token = var("GH_TOKEN").or_else(|| var("GITHUB_TOKEN"));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SwarmError> {
        let invalid = |msg: String| -> Result<(), SwarmError> {
            Err(SwarmError::config_with_code(ErrorCode::CONFIG_INVALID_VALUE, msg))
        };

        if self.engine.max_concurrent == 0 {
            return invalid("engine.max_concurrent must be at least 1".into());
        }
        if self.engine.poll_interval.is_zero() {
            return invalid("engine.poll_interval must be positive".into());
        }
        if self.lease.pool_size == 0 {
            return invalid("lease.pool_size must be at least 1".into());
        }
        if self.lease.max_slot_index < self.lease.pool_size {
            return invalid(format!(
                "lease.max_slot_index ({}) is below lease.pool_size ({})",
                self.lease.max_slot_index, self.lease.pool_size
            ));
        }
        if self.verification.retry.max_attempts == 0 {
            return invalid("verification.retry.max_attempts must be at least 1".into());
        }
        if self.engine.sentinel.enabled && self.engine.sentinel.agent_id.trim().is_empty() {
            return invalid("engine.sentinel.agent_id is required when the sentinel is enabled".into());
        }
        Ok(())
    }

    /// `[variables]` as JSON for the resolver's `config` layer
    pub fn variables_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.variables).unwrap_or(serde_json::Value::Null)
    }

    pub fn secrets_from_env(&self) -> HashMap<String, String> {
        self.secret_env
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
            .collect()
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T, SwarmError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| {
        SwarmError::config_with_code(
            ErrorCode::CONFIG_INVALID_VALUE,
            format!("{}='{}': {}", name, value, e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_log_level_by_verbosity() {
        assert_eq!(AppConfig::new(0).log_level(), "info");
        assert_eq!(AppConfig::new(1).log_level(), "debug");
        assert!(AppConfig::new(5).log_level().starts_with("trace,"));
    }

    #[test]
    fn test_toml_sections_and_defaults() {
        let settings = EngineSettings::from_toml(
            r#"
agents_dir = "/etc/swarm/agents"

[engine]
max_concurrent = 2
shutdown_timeout = "10s"

[lease]
pool_size = 2
max_slot_index = 4
lock_dir = "/run/swarm/locks"

[verification]
judge_url = "http://judge:8080/verify"

[verification.retry]
max_attempts = 5

[variables]
org = "acme"
"#,
        )
        .unwrap();

        assert_eq!(settings.engine.max_concurrent, 2);
        assert_eq!(settings.engine.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(settings.lease.max_slot_index, 4);
        assert_eq!(settings.verification.retry.max_attempts, 5);
        assert_eq!(settings.verification.judge_timeout, Duration::from_secs(300));
        assert_eq!(settings.variables_json()["org"], serde_json::json!("acme"));
        assert!(settings.database.url.is_empty());
        settings.validate().unwrap();
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut settings = EngineSettings::default();
        settings
            .apply_env(env(&[
                ("DATABASE_URL", "postgres://fallback"),
                ("SWARM_MAX_CONCURRENT", "7"),
                ("SWARM_POLL_INTERVAL_MS", "250"),
                ("SWARM_PID_FILE", "/run/swarm.pid"),
            ]))
            .unwrap();
        assert_eq!(settings.database.url, "postgres://fallback");
        assert_eq!(settings.engine.max_concurrent, 7);
        assert_eq!(settings.engine.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.pid_file, Some(PathBuf::from("/run/swarm.pid")));

        settings
            .apply_env(env(&[
                ("SWARM_DATABASE_URL", "postgres://primary"),
                ("DATABASE_URL", "postgres://fallback"),
            ]))
            .unwrap();
        assert_eq!(settings.database.url, "postgres://primary");
    }

    #[test]
    fn test_github_token_falls_back_to_github_token_var() {
        let mut settings = EngineSettings::default();
        settings
            .apply_env(env(&[("GITHUB_TOKEN", "from-actions")]))
            .unwrap();
        assert_eq!(
            settings.engine.sentinel.github_token.as_deref(),
            Some("from-actions")
        );

        let mut settings = EngineSettings::default();
        settings
            .apply_env(env(&[("GH_TOKEN", "gh"), ("GITHUB_TOKEN", "actions")]))
            .unwrap();
        assert_eq!(settings.engine.sentinel.github_token.as_deref(), Some("gh"));
    }

    #[test]
    fn test_bad_values_are_config_errors() {
        let mut settings = EngineSettings::default();
        let err = settings
            .apply_env(env(&[("SWARM_MAX_CONCURRENT", "many")]))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CONFIG_INVALID_VALUE);

        settings.lease.max_slot_index = 1;
        settings.lease.pool_size = 3;
        assert!(settings.validate().is_err());

        assert_eq!(
            EngineSettings::from_toml("engine = 3").unwrap_err().code(),
            ErrorCode::CONFIG_PARSE_ERROR
        );
    }
}
