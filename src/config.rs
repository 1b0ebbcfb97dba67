use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use transition_system::config::{read_toml, ConfigError};
use transition_system::Bus;

use crate::coordinator::RetryPolicy;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub contention_backoff_ms: u64,
    pub transient_backoff_ms: u64,
    pub max_lock_attempts: u32,
    pub bus: Bus,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            contention_backoff_ms: policy.contention_backoff.as_millis() as u64,
            transient_backoff_ms: policy.transient_backoff.as_millis() as u64,
            max_lock_attempts: policy.max_attempts,
            bus: Bus::System,
        }
    }
}

impl ClientConfig {
    pub fn read(path: impl AsRef<Path>) -> Result<Option<Self>, ConfigError> {
        read_toml(path.as_ref())
    }

    pub fn load(path: impl AsRef<Path>) -> Self {
        match Self::read(path) {
            Ok(config) => config.unwrap_or_default(),
            Err(e) => {
                tracing::error!(target: "PopTransition::Config", "{e}, using defaults");
                Self::default()
            }
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            contention_backoff: Duration::from_millis(self.contention_backoff_ms),
            transient_backoff: Duration::from_millis(self.transient_backoff_ms),
            max_attempts: self.max_lock_attempts.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_retry_policy() {
        assert_eq!(ClientConfig::default().retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn file_overrides_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pop-transition.toml");
        std::fs::write(&path, "contention_backoff_ms = 1000\nmax_lock_attempts = 0\n").unwrap();

        let policy = ClientConfig::load(&path).retry_policy();
        assert_eq!(policy.contention_backoff, Duration::from_secs(1));
        assert_eq!(policy.transient_backoff, Duration::from_millis(500));
        assert_eq!(policy.max_attempts, 1);
    }
}
