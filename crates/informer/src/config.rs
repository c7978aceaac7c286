//! Informer configuration: defaults, builder setters and `SHOAL_*` env overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InformerConfig {
    /// Name used in logs and metric labels.
    pub name: String,
    /// Period of the forced full resync. `Duration::ZERO` disables it.
    pub resync_interval: Duration,
    /// Backoff applied to list retries and watch reconnects.
    pub backoff: BackoffConfig,
    /// Attempts for the initial listing before the informer gives up with `SyncFailed`.
    pub list_attempts: usize,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            name: "informer".to_string(),
            resync_interval: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            list_attempts: 5,
        }
    }
}

impl InformerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    /// Defaults overridden by `SHOAL_RESYNC_SECS`, `SHOAL_BACKOFF_BASE_MS`,
    /// `SHOAL_BACKOFF_MAX_MS`, `SHOAL_BACKOFF_JITTER` and `SHOAL_LIST_ATTEMPTS`.
    /// Unparseable values fall back to the default.
    pub fn from_env(name: impl Into<String>) -> Self {
        let d = Self::new(name);
        let resync_secs = std::env::var("SHOAL_RESYNC_SECS").ok().and_then(|s| s.parse::<u64>().ok());
        let base_ms = std::env::var("SHOAL_BACKOFF_BASE_MS").ok().and_then(|s| s.parse::<u64>().ok());
        let max_ms = std::env::var("SHOAL_BACKOFF_MAX_MS").ok().and_then(|s| s.parse::<u64>().ok());
        let jitter = std::env::var("SHOAL_BACKOFF_JITTER")
            .ok()
            .map(|v| !(v == "0" || v.eq_ignore_ascii_case("false")));
        let list_attempts = std::env::var("SHOAL_LIST_ATTEMPTS").ok().and_then(|s| s.parse::<usize>().ok());
        Self {
            resync_interval: resync_secs.map(Duration::from_secs).unwrap_or(d.resync_interval),
            backoff: BackoffConfig {
                base: base_ms.map(Duration::from_millis).unwrap_or(d.backoff.base),
                max: max_ms.map(Duration::from_millis).unwrap_or(d.backoff.max),
                jitter: jitter.unwrap_or(d.backoff.jitter),
            },
            list_attempts: list_attempts.unwrap_or(d.list_attempts).max(1),
            ..d
        }
    }

    #[must_use]
    pub fn with_resync(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_list_attempts(mut self, attempts: usize) -> Self {
        self.list_attempts = attempts.max(1);
        self
    }

    pub fn resync_enabled(&self) -> bool {
        !self.resync_interval.is_zero()
    }

    /// Flattened view for logs and `-o json` output.
    pub fn summary(&self) -> ConfigSummary {
        ConfigSummary {
            name: self.name.clone(),
            resync_secs: self.resync_interval.as_secs(),
            backoff_base_ms: self.backoff.base.as_millis() as u64,
            backoff_max_ms: self.backoff.max.as_millis() as u64,
            backoff_jitter: self.backoff.jitter,
            list_attempts: self.list_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigSummary {
    pub name: String,
    pub resync_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter: bool,
    pub list_attempts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let c = InformerConfig::default();
        assert_eq!(c.backoff.base, Duration::from_millis(100));
        assert_eq!(c.backoff.max, Duration::from_secs(30));
        assert!(c.backoff.jitter);
        assert!(c.resync_enabled());
    }

    #[test]
    fn zero_resync_disables() {
        let c = InformerConfig::new("pods").with_resync(Duration::ZERO).with_list_attempts(0);
        assert!(!c.resync_enabled());
        assert_eq!(c.list_attempts, 1);
        assert_eq!(c.summary().name, "pods");
    }
}
