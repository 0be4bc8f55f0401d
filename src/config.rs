//! Top-level configuration: one `serde`-deserializable document that
//! assembles a [`crate::kernel::Kernel`], [`crate::polling::PollingEngine`],
//! and [`crate::client::ClientConfig`] for the reactive client, plus the
//! queue and cache settings.
//!
//! Grounded on the teacher `retry.rs`'s validating-builder shape
//! (`RetryPolicyBuilder` → `BuildError`), now applied at the level of the
//! whole assembled config document rather than to `RetryPolicy` alone: the
//! per-module config structs (`RetryPolicy`, `PollingConfig`, `QueueConfig`)
//! already carry their own `Default`, so this module's job is wiring them
//! together and validating cross-field constraints the individual structs
//! can't check in isolation (e.g. `polling.min_interval <= polling.max_interval`).

use crate::client::ClientConfig;
use crate::kernel::RetryPolicy;
use crate::polling::{PollingConfig, PollingStrategy};
use crate::queue::{QueueConfig, QueueDiscipline};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },
    #[error("polling.min_interval ({min:?}) must be <= polling.max_interval ({max:?})")]
    PollingIntervalOrder { min: Duration, max: Duration },
    #[error("kernel.initial_delay ({initial:?}) must be <= kernel.max_delay ({max:?})")]
    RetryDelayOrder { initial: Duration, max: Duration },
    #[error("cache.ttl must not be zero")]
    ZeroCacheTtl,
    #[error("failed to parse config document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Cache sizing/TTL knobs (spec §4.4); `ExecutionCache` itself takes these
/// as plain constructor arguments, this struct exists purely so a whole
/// runtime can be described by one deserializable document.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "duration_millis")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(60) }
    }
}

/// The full runtime configuration document.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub client: ClientConfigDocument,
    pub retry: RetryPolicyDocument,
    pub polling: PollingConfigDocument,
    pub queue: QueueConfigDocument,
    pub cache: CacheConfig,
}

/// `ClientConfig` mirrored with `serde::Deserialize` support; `ClientConfig`
/// itself stays plain (it holds a non-serializable `Duration` pair in the
/// hot path and is constructed directly by callers embedding this crate),
/// this document is the wire-facing counterpart.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfigDocument {
    pub base_url: String,
    pub api_key_header_name: Option<String>,
    pub api_key: Option<String>,
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub default_poll_interval: Duration,
    #[serde(with = "duration_millis")]
    pub health_probe_interval: Duration,
}

impl Default for ClientConfigDocument {
    fn default() -> Self {
        let defaults = ClientConfig::default();
        Self {
            base_url: defaults.base_url,
            api_key_header_name: None,
            api_key: None,
            request_timeout: defaults.request_timeout,
            default_poll_interval: defaults.default_poll_interval,
            health_probe_interval: defaults.health_probe_interval,
        }
    }
}

impl From<ClientConfigDocument> for ClientConfig {
    fn from(doc: ClientConfigDocument) -> Self {
        Self {
            base_url: doc.base_url,
            api_key_header: doc.api_key_header_name.zip(doc.api_key),
            request_timeout: doc.request_timeout,
            default_poll_interval: doc.default_poll_interval,
            health_probe_interval: doc.health_probe_interval,
        }
    }
}

/// `RetryPolicy` mirrored with `serde::Deserialize` support; the
/// `retryable_kinds`/`retryable_statuses` sets are easiest to express as
/// vectors on the wire and converted to the hash sets `RetryPolicy` wants.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicyDocument {
    pub max_attempts: usize,
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter_fraction: f64,
    pub circuit_breaker_enabled: bool,
    pub circuit_breaker_threshold: usize,
    #[serde(with = "duration_millis")]
    pub circuit_breaker_cooldown: Duration,
}

impl Default for RetryPolicyDocument {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_attempts: defaults.max_attempts,
            initial_delay: defaults.initial_delay,
            max_delay: defaults.max_delay,
            backoff_factor: defaults.backoff_factor,
            jitter_fraction: defaults.jitter_fraction,
            circuit_breaker_enabled: defaults.circuit_breaker_enabled,
            circuit_breaker_threshold: defaults.circuit_breaker_threshold,
            circuit_breaker_cooldown: defaults.circuit_breaker_cooldown,
        }
    }
}

impl From<RetryPolicyDocument> for RetryPolicy {
    fn from(doc: RetryPolicyDocument) -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_attempts: doc.max_attempts,
            initial_delay: doc.initial_delay,
            max_delay: doc.max_delay,
            backoff_factor: doc.backoff_factor,
            jitter_fraction: doc.jitter_fraction,
            retryable_kinds: defaults.retryable_kinds,
            retryable_statuses: defaults.retryable_statuses,
            circuit_breaker_enabled: doc.circuit_breaker_enabled,
            circuit_breaker_threshold: doc.circuit_breaker_threshold,
            circuit_breaker_cooldown: doc.circuit_breaker_cooldown,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PollingStrategyDocument {
    Fixed,
    Adaptive,
    Smart,
    Hybrid,
}

impl Default for PollingStrategyDocument {
    fn default() -> Self {
        Self::Smart
    }
}

impl From<PollingStrategyDocument> for PollingStrategy {
    fn from(doc: PollingStrategyDocument) -> Self {
        match doc {
            PollingStrategyDocument::Fixed => PollingStrategy::Fixed,
            PollingStrategyDocument::Adaptive => PollingStrategy::Adaptive,
            PollingStrategyDocument::Smart => PollingStrategy::Smart,
            PollingStrategyDocument::Hybrid => PollingStrategy::Hybrid,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfigDocument {
    pub strategy: PollingStrategyDocument,
    #[serde(with = "duration_millis")]
    pub base_interval: Duration,
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,
    pub backoff_factor: f64,
    #[serde(with = "duration_millis")]
    pub activity_window: Duration,
    pub max_consecutive_errors: u32,
    pub battery_optimize: bool,
    pub adaptive_throttle: bool,
    pub per_status_interval_millis: HashMap<String, u64>,
}

impl Default for PollingConfigDocument {
    fn default() -> Self {
        let defaults = PollingConfig::default();
        Self {
            strategy: PollingStrategyDocument::Smart,
            base_interval: defaults.base_interval,
            min_interval: defaults.min_interval,
            max_interval: defaults.max_interval,
            backoff_factor: defaults.backoff_factor,
            activity_window: defaults.activity_window,
            max_consecutive_errors: defaults.max_consecutive_errors,
            battery_optimize: defaults.battery_optimize,
            adaptive_throttle: defaults.adaptive_throttle,
            per_status_interval_millis: defaults.per_status_interval.into_iter().map(|(k, v)| (k, v.as_millis() as u64)).collect(),
        }
    }
}

impl From<PollingConfigDocument> for PollingConfig {
    fn from(doc: PollingConfigDocument) -> Self {
        Self {
            strategy: doc.strategy.into(),
            base_interval: doc.base_interval,
            min_interval: doc.min_interval,
            max_interval: doc.max_interval,
            backoff_factor: doc.backoff_factor,
            activity_window: doc.activity_window,
            max_consecutive_errors: doc.max_consecutive_errors,
            battery_optimize: doc.battery_optimize,
            adaptive_throttle: doc.adaptive_throttle,
            per_status_interval: doc.per_status_interval_millis.into_iter().map(|(k, v)| (k, Duration::from_millis(v))).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueDisciplineDocument {
    Throttled,
    Concurrent,
}

impl Default for QueueDisciplineDocument {
    fn default() -> Self {
        Self::Throttled
    }
}

impl From<QueueDisciplineDocument> for QueueDiscipline {
    fn from(doc: QueueDisciplineDocument) -> Self {
        match doc {
            QueueDisciplineDocument::Throttled => QueueDiscipline::Throttled,
            QueueDisciplineDocument::Concurrent => QueueDiscipline::Concurrent,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfigDocument {
    pub discipline: QueueDisciplineDocument,
    #[serde(with = "duration_millis")]
    pub throttle_interval: Duration,
    pub max_concurrent: usize,
    pub wait_for_completion: bool,
    pub retry_failed_items: bool,
    pub max_retries: u32,
}

impl Default for QueueConfigDocument {
    fn default() -> Self {
        let defaults = QueueConfig::default();
        Self {
            discipline: QueueDisciplineDocument::Throttled,
            throttle_interval: defaults.throttle_interval,
            max_concurrent: defaults.max_concurrent,
            wait_for_completion: defaults.wait_for_completion,
            retry_failed_items: defaults.retry_failed_items,
            max_retries: defaults.max_retries,
        }
    }
}

impl From<QueueConfigDocument> for QueueConfig {
    fn from(doc: QueueConfigDocument) -> Self {
        Self {
            discipline: doc.discipline.into(),
            throttle_interval: doc.throttle_interval,
            max_concurrent: doc.max_concurrent,
            wait_for_completion: doc.wait_for_completion,
            retry_failed_items: doc.retry_failed_items,
            max_retries: doc.max_retries,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.base_url.trim().is_empty() {
            return Err(ConfigError::Empty { field: "client.base_url" });
        }
        if self.client.request_timeout.is_zero() {
            return Err(ConfigError::NotPositive { field: "client.request_timeout" });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::NotPositive { field: "retry.max_attempts" });
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(ConfigError::RetryDelayOrder { initial: self.retry.initial_delay, max: self.retry.max_delay });
        }
        if self.polling.min_interval > self.polling.max_interval {
            return Err(ConfigError::PollingIntervalOrder { min: self.polling.min_interval, max: self.polling.max_interval });
        }
        if self.cache.ttl.is_zero() {
            return Err(ConfigError::ZeroCacheTtl);
        }
        Ok(())
    }

    pub fn client_config(&self) -> ClientConfig {
        self.client.clone().into()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone().into()
    }

    pub fn polling_config(&self) -> PollingConfig {
        self.polling.clone().into()
    }

    pub fn queue_config(&self) -> QueueConfig {
        self.queue.clone().into()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_document_parses_and_validates() {
        let config = RuntimeConfig::from_json(r#"{"client":{"base_url":"https://engine.test"}}"#).unwrap();
        assert_eq!(config.client.base_url, "https://engine.test");
        assert_eq!(config.retry.max_attempts, RetryPolicy::default().max_attempts);
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let err = RuntimeConfig::from_json(r#"{"client":{"base_url":""}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Empty { field: "client.base_url" }));
    }

    #[test]
    fn inverted_retry_delay_bounds_are_rejected() {
        let err = RuntimeConfig::from_json(
            r#"{"client":{"base_url":"https://engine.test"},"retry":{"initial_delay":5000,"max_delay":1000}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::RetryDelayOrder { .. }));
    }

    #[test]
    fn inverted_polling_interval_bounds_are_rejected() {
        let err = RuntimeConfig::from_json(
            r#"{"client":{"base_url":"https://engine.test"},"polling":{"min_interval":60000,"max_interval":1000}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::PollingIntervalOrder { .. }));
    }

    #[test]
    fn zero_cache_ttl_is_rejected() {
        let err = RuntimeConfig::from_json(r#"{"client":{"base_url":"https://engine.test"},"cache":{"ttl":0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroCacheTtl));
    }

    #[test]
    fn client_config_conversion_merges_api_key_header() {
        let config = RuntimeConfig::from_json(
            r#"{"client":{"base_url":"https://engine.test","api_key_header_name":"X-N8N-API-KEY","api_key":"secret"}}"#,
        )
        .unwrap();
        let client_config = config.client_config();
        assert_eq!(client_config.api_key_header, Some(("X-N8N-API-KEY".to_string(), "secret".to_string())));
    }
}
