use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_concurrent() -> usize {
    4
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_max_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_max_parallel_steps() -> usize {
    4
}

fn default_pool_backoff() -> Duration {
    Duration::from_secs(5)
}

/// Scheduling loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Tickets worked on at the same time by this process
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default = "default_max_poll_interval", with = "humantime_serde")]
    pub max_poll_interval: Duration,
    /// Growth of the poll interval per empty cycle
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Steps of one workflow run dispatched at the same time
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
    /// How long a ticket requeued on an exhausted pool waits before it is claimable again
    #[serde(default = "default_pool_backoff", with = "humantime_serde")]
    pub pool_backoff: Duration,
    #[serde(default)]
    pub sentinel: SentinelConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            poll_interval: default_poll_interval(),
            max_poll_interval: default_max_poll_interval(),
            backoff_factor: default_backoff_factor(),
            shutdown_timeout: default_shutdown_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            max_parallel_steps: default_max_parallel_steps(),
            pool_backoff: default_pool_backoff(),
            sentinel: SentinelConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SentinelConfig {
    pub enabled: bool,
    /// Assignee id of the reviewing agent
    pub agent_id: String,
    #[serde(with = "humantime_serde")]
    pub merge_timeout: Duration,
    /// Exported to `gh` as `GH_TOKEN`
    pub github_token: Option<String>,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            agent_id: "sentinel".to_string(),
            merge_timeout: Duration::from_secs(60),
            github_token: None,
        }
    }
}

/// Poll interval that stretches while there is nothing to do
#[derive(Debug, Clone)]
pub struct PollBackoff {
    base: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
}

impl PollBackoff {
    pub fn new(base: Duration, max: Duration, factor: f64) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            factor: factor.max(1.0),
            current: base,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.poll_interval,
            config.max_poll_interval,
            config.backoff_factor,
        )
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Interval to sleep after a cycle that did or did not dispatch work
    pub fn next_interval(&mut self, dispatched: bool) -> Duration {
        if dispatched {
            self.current = self.base;
        } else {
            let grown = self.current.as_secs_f64() * self.factor;
            self.current = Duration::from_secs_f64(grown.min(self.max.as_secs_f64()));
        }
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_caps_and_resets() {
        let mut backoff = PollBackoff::new(Duration::from_secs(2), Duration::from_secs(5), 1.5);
        assert_eq!(backoff.next_interval(false), Duration::from_secs(3));
        assert_eq!(backoff.next_interval(false), Duration::from_secs_f64(4.5));
        assert_eq!(backoff.next_interval(false), Duration::from_secs(5));
        assert_eq!(backoff.next_interval(false), Duration::from_secs(5));
        assert_eq!(backoff.next_interval(true), Duration::from_secs(2));
    }

    #[test]
    fn test_config_from_partial_toml() {
        let config: EngineConfig = toml::from_str(
            "max_concurrent = 8\npoll_interval = \"500ms\"\n[sentinel]\nenabled = true\n",
        )
        .unwrap();
        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.max_poll_interval, Duration::from_secs(30));
        assert!(config.sentinel.enabled);
        assert_eq!(config.sentinel.agent_id, "sentinel");
    }
}
