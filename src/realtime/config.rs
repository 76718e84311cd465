//! # Realtime Configuration
//!
//! JSON configuration for the supervisor. Every field has a default, so an
//! empty object `{}` is a valid config that watches the four CRM tables.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::backoff::BackoffPolicy;
use super::errors::{RealtimeError, RealtimeResult};
use super::feed::FeedSpec;
use crate::observability::{log_event_with_fields, Event, Logger, Severity};

/// Reconnect policy section
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first retry (default 1s)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on the un-jittered delay (default 60s)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Consecutive failures before giving up (default 10)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Upper bound of additive jitter, as a fraction of the delay (default 0.3)
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

/// Supervisor configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RealtimeConfig {
    /// Feeds to keep open
    #[serde(default = "default_feeds")]
    pub feeds: Vec<FeedSpec>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Keepalive probe period (default 4.5 minutes)
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,

    /// Probe round-trip budget before it counts as failed (default 10s)
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Visibility flips closer than this are ignored (default 1s)
    #[serde(default = "default_visibility_debounce_ms")]
    pub visibility_debounce_ms: u64,

    /// Number of state transitions kept for diagnostics
    #[serde(default = "default_transition_history")]
    pub transition_history: usize,

    /// Minimum log severity
    #[serde(default = "default_log_level")]
    pub log_level: Severity,
}

fn default_feeds() -> Vec<FeedSpec> {
    ["leads", "services", "bookings", "assessments"]
        .iter()
        .map(|table| FeedSpec::table(table))
        .collect()
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_jitter_ratio() -> f64 {
    0.3
}
fn default_keepalive_interval_ms() -> u64 {
    270_000
} // 4.5 min
fn default_probe_timeout_ms() -> u64 {
    10_000
}
fn default_visibility_debounce_ms() -> u64 {
    1_000
}
fn default_transition_history() -> usize {
    256
}
fn default_log_level() -> Severity {
    Severity::Info
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            feeds: default_feeds(),
            reconnect: ReconnectConfig::default(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            visibility_debounce_ms: default_visibility_debounce_ms(),
            transition_history: default_transition_history(),
            log_level: default_log_level(),
        }
    }
}

impl RealtimeConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> RealtimeResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            RealtimeError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json(&content)?;
        log_event_with_fields(
            Event::ConfigLoaded,
            &[
                ("path", &path.display().to_string()),
                ("feeds", &config.feeds.len().to_string()),
            ],
        );
        Ok(config)
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json(content: &str) -> RealtimeResult<Self> {
        let config: RealtimeConfig = serde_json::from_str(content)
            .map_err(|e| RealtimeError::ConfigError(format!("Invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the supervisor cannot run with
    pub fn validate(&self) -> RealtimeResult<()> {
        if self.feeds.is_empty() {
            return Err(RealtimeError::ConfigError(
                "at least one feed is required".into(),
            ));
        }

        let mut topics = std::collections::HashSet::new();
        for feed in &self.feeds {
            if feed.topic.trim().is_empty() || feed.source_table.trim().is_empty() {
                return Err(RealtimeError::ConfigError(
                    "feed topic and source_table must be non-empty".into(),
                ));
            }
            if !topics.insert(feed.topic.as_str()) {
                return Err(RealtimeError::ConfigError(format!(
                    "duplicate feed topic '{}'",
                    feed.topic
                )));
            }
        }

        let reconnect = &self.reconnect;
        if reconnect.base_delay_ms == 0 {
            return Err(RealtimeError::ConfigError(
                "reconnect.base_delay_ms must be > 0".into(),
            ));
        }
        if reconnect.max_delay_ms < reconnect.base_delay_ms {
            return Err(RealtimeError::ConfigError(format!(
                "reconnect.max_delay_ms ({}) must be >= base_delay_ms ({})",
                reconnect.max_delay_ms, reconnect.base_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&reconnect.jitter_ratio) {
            return Err(RealtimeError::ConfigError(format!(
                "reconnect.jitter_ratio must be within 0..=1, got {}",
                reconnect.jitter_ratio
            )));
        }

        if self.keepalive_interval_ms == 0 {
            return Err(RealtimeError::ConfigError(
                "keepalive_interval_ms must be > 0".into(),
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(RealtimeError::ConfigError(
                "probe_timeout_ms must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Apply `log_level` to the process-wide logger threshold.
    ///
    /// The threshold is global, not per supervisor: call this once at
    /// application startup.
    pub fn apply_log_level(&self) {
        Logger::set_min_severity(self.log_level);
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            max_attempts: self.reconnect.max_attempts,
            jitter_ratio: self.reconnect.jitter_ratio,
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn visibility_debounce(&self) -> Duration {
        Duration::from_millis(self.visibility_debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = RealtimeConfig::from_json("{}").unwrap();
        assert_eq!(config, RealtimeConfig::default());

        let topics: Vec<&str> = config.feeds.iter().map(|f| f.topic.as_str()).collect();
        assert_eq!(topics, vec!["leads", "services", "bookings", "assessments"]);
        assert_eq!(config.keepalive_interval(), Duration::from_millis(270_000));
        assert_eq!(config.backoff_policy(), BackoffPolicy::default());
    }

    #[test]
    fn test_partial_override() {
        let config = RealtimeConfig::from_json(
            r#"{
                "feeds": [{"topic": "leads", "source_table": "crm_leads"}],
                "reconnect": {"max_attempts": 3},
                "log_level": "warn"
            }"#,
        )
        .unwrap();

        assert_eq!(config.feeds.len(), 1);
        assert_eq!(config.feeds[0].source_table, "crm_leads");
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.base_delay_ms, 1_000);
        assert_eq!(config.log_level, Severity::Warn);
    }

    #[test]
    fn test_rejects_duplicate_topics() {
        let err = RealtimeConfig::from_json(
            r#"{"feeds": [
                {"topic": "leads", "source_table": "a"},
                {"topic": "leads", "source_table": "b"}
            ]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, RealtimeError::ConfigError(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn test_rejects_bad_backoff() {
        let err = RealtimeConfig::from_json(
            r#"{"reconnect": {"base_delay_ms": 5000, "max_delay_ms": 10}}"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "RT_CONFIG_ERROR");

        let err = RealtimeConfig::from_json(r#"{"reconnect": {"jitter_ratio": 1.5}}"#).unwrap_err();
        assert_eq!(err.code(), "RT_CONFIG_ERROR");
    }

    #[test]
    fn test_rejects_empty_feeds_and_bad_json() {
        assert!(RealtimeConfig::from_json(r#"{"feeds": []}"#).is_err());
        assert!(RealtimeConfig::from_json("{not json").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"keepalive_interval_ms": 1000}}"#).unwrap();

        let config = RealtimeConfig::load(file.path()).unwrap();
        assert_eq!(config.keepalive_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_apply_log_level_sets_global_threshold() {
        let config = RealtimeConfig::from_json(r#"{"log_level": "trace"}"#).unwrap();
        config.apply_log_level();
        assert_eq!(Logger::min_severity(), Severity::Trace);
        assert!(Logger::enabled(Severity::Trace));

        RealtimeConfig::default().apply_log_level();
        assert_eq!(Logger::min_severity(), Severity::Info);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = RealtimeConfig::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, RealtimeError::ConfigError(_)));
    }
}
