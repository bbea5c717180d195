//! Configuration loading and representation.
//!
//! Defaults target a single-node pipeline; every knob can be
//! overridden through `NARRATOR_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Full pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub queue: QueueConfig,
    pub orchestrator: OrchestratorConfig,
    pub recovery: RecoveryConfig,
    pub worker: WorkerConfig,
}

/// Per-queue envelope policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempts an envelope gets when `enqueue` does not specify one.
    pub default_max_attempts: u32,
    /// In-flight envelopes older than this are reclaimed as failed.
    /// `None` disables reclaiming (stalled envelopes stay in flight forever).
    pub visibility_timeout_ms: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            visibility_timeout_ms: Some(300_000),
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Option<Duration> {
        self.visibility_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Share of failed items (percent, rounded up) that fails the whole job.
    pub failure_threshold_percent: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            failure_threshold_percent: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound of the positive jitter, as a fraction of the base delay.
    pub jitter: f64,
    /// Retries an error log (and an item across recoveries) may consume.
    pub max_retries: u32,
    pub rate_limit_cooldown_ms: u64,
    /// Resolved error logs older than this are purged by cleanup.
    pub retention_days: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            jitter: 0.2,
            max_retries: 5,
            rate_limit_cooldown_ms: 5_000,
            retention_days: 30,
        }
    }
}

impl RecoveryConfig {
    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Sleep between polls when a queue is empty.
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl PipelineConfig {
    /// Defaults overlaid with `NARRATOR_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup` (keyed like the env vars).
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        overlay(&lookup, "NARRATOR_QUEUE_MAX_ATTEMPTS", &mut config.queue.default_max_attempts);
        let mut visibility_ms = config.queue.visibility_timeout_ms.unwrap_or(0);
        if overlay(&lookup, "NARRATOR_QUEUE_VISIBILITY_TIMEOUT_MS", &mut visibility_ms) {
            // 0 disables reclaiming.
            config.queue.visibility_timeout_ms = (visibility_ms > 0).then_some(visibility_ms);
        }

        overlay(
            &lookup,
            "NARRATOR_FAILURE_THRESHOLD_PERCENT",
            &mut config.orchestrator.failure_threshold_percent,
        );

        let recovery = &mut config.recovery;
        overlay(&lookup, "NARRATOR_RETRY_BASE_DELAY_MS", &mut recovery.base_delay_ms);
        overlay(&lookup, "NARRATOR_RETRY_MAX_DELAY_MS", &mut recovery.max_delay_ms);
        overlay(&lookup, "NARRATOR_RETRY_JITTER", &mut recovery.jitter);
        overlay(&lookup, "NARRATOR_MAX_RETRIES", &mut recovery.max_retries);
        overlay(&lookup, "NARRATOR_RATE_LIMIT_COOLDOWN_MS", &mut recovery.rate_limit_cooldown_ms);
        overlay(&lookup, "NARRATOR_ERROR_RETENTION_DAYS", &mut recovery.retention_days);

        overlay(&lookup, "NARRATOR_WORKER_POLL_INTERVAL_MS", &mut config.worker.poll_interval_ms);

        config
    }
}

fn overlay<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) -> bool
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return false;
    };

    match raw.trim().parse::<T>() {
        Ok(value) => {
            *target = value;
            true
        }
        Err(err) => {
            warn!(key, value = %raw, error = %err, "ignoring invalid configuration value");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_reference_pipeline() {
        let config = PipelineConfig::default();
        assert_eq!(config.queue.default_max_attempts, 3);
        assert_eq!(config.orchestrator.failure_threshold_percent, 30);
        assert_eq!(config.recovery.base_delay_ms, 1_000);
        assert_eq!(config.recovery.max_delay_ms, 300_000);
        assert_eq!(config.recovery.rate_limit_cooldown(), Duration::from_secs(5));
        assert_eq!(config.recovery.retention_days, 30);
    }

    #[test]
    fn overrides_apply_and_invalid_values_are_ignored() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("NARRATOR_QUEUE_MAX_ATTEMPTS", "5"),
            ("NARRATOR_FAILURE_THRESHOLD_PERCENT", "not-a-number"),
            ("NARRATOR_RETRY_JITTER", "0.5"),
            ("NARRATOR_WORKER_POLL_INTERVAL_MS", " 25 "),
        ]));

        assert_eq!(config.queue.default_max_attempts, 5);
        assert_eq!(config.orchestrator.failure_threshold_percent, 30);
        assert_eq!(config.recovery.jitter, 0.5);
        assert_eq!(config.worker.poll_interval(), Duration::from_millis(25));
    }

    #[test]
    fn zero_visibility_timeout_disables_reclaiming() {
        let config =
            PipelineConfig::from_lookup(lookup(&[("NARRATOR_QUEUE_VISIBILITY_TIMEOUT_MS", "0")]));
        assert_eq!(config.queue.visibility_timeout(), None);
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"recovery": {"max_retries": 2}}"#).unwrap();
        assert_eq!(config.recovery.max_retries, 2);
        assert_eq!(config.recovery.base_delay_ms, 1_000);
        assert_eq!(config.queue, QueueConfig::default());
    }
}
