//! Settings and configuration module
//!
//! Provides file-based configuration with:
//! - JSON loading
//! - Millisecond-based tunables
//! - Validation before conversion into [`DispatcherConfig`]

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::dispatcher::DispatcherConfig;
use crate::modules::governor::GovernorConfig;
use crate::modules::pacing::PacingConfig;
use crate::modules::proxy::RotationStrategy;
use crate::transport::TransportConfig;

/// Upper bound for cooldown, throttle window, reset interval and cache TTL.
pub const MAX_WINDOW_MS: u64 = 30 * 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Serializable mirror of [`DispatcherConfig`]. Missing fields take the
/// dispatcher defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub queue_capacity: usize,
    pub require_proxy: bool,
    pub rotation: RotationStrategy,

    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub throttle_delay_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,

    pub max_errors: u32,
    pub cooldown_ms: u64,
    pub throttle_window_ms: u64,
    pub throttle_threshold: usize,
    pub history_limit: usize,
    pub reset_interval_ms: u64,

    pub timeout_ms: u64,
    pub max_redirects: usize,
    pub max_clients: usize,

    pub cache_ttl_ms: u64,
    pub enable_metrics: bool,
    pub rng_seed: Option<u64>,
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

impl From<&DispatcherConfig> for DispatchSettings {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            max_attempts: config.max_attempts,
            queue_capacity: config.queue_capacity,
            require_proxy: config.require_proxy,
            rotation: config.rotation,
            min_delay_ms: millis(config.pacing.min_delay),
            max_delay_ms: millis(config.pacing.max_delay),
            jitter_ms: millis(config.pacing.jitter),
            throttle_delay_ms: millis(config.pacing.throttle_delay),
            backoff_base_ms: millis(config.pacing.backoff_base),
            backoff_cap_ms: millis(config.pacing.backoff_cap),
            max_errors: config.governor.max_errors,
            cooldown_ms: millis(config.governor.cooldown),
            throttle_window_ms: millis(config.governor.throttle_window),
            throttle_threshold: config.governor.throttle_threshold,
            history_limit: config.governor.history_limit,
            reset_interval_ms: millis(config.governor.reset_interval),
            timeout_ms: millis(config.transport.timeout),
            max_redirects: config.transport.max_redirects,
            max_clients: config.transport.max_clients,
            cache_ttl_ms: millis(config.cache_ttl),
            enable_metrics: config.enable_metrics,
            rng_seed: config.rng_seed,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from(&DispatcherConfig::default())
    }
}

impl DispatchSettings {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        log::debug!("loaded dispatcher settings from {}", path.as_ref().display());
        Self::from_json(&raw)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1");
        }
        if self.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be at least 1");
        }
        if self.min_delay_ms > self.max_delay_ms {
            return invalid("min_delay_ms exceeds max_delay_ms");
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            return invalid("backoff_base_ms exceeds backoff_cap_ms");
        }
        if self.max_errors == 0 {
            return invalid("max_errors must be at least 1");
        }
        if self.throttle_threshold == 0 || self.throttle_window_ms == 0 {
            return invalid("throttle window and threshold must be non-zero");
        }
        if self.history_limit < self.throttle_threshold {
            return invalid("history_limit must hold at least throttle_threshold entries");
        }
        if self.timeout_ms == 0 {
            return invalid("timeout_ms must be non-zero");
        }
        if self.max_clients == 0 {
            return invalid("max_clients must be at least 1");
        }
        if self.reset_interval_ms == 0 {
            return invalid("reset_interval_ms must be non-zero");
        }
        let windows = [
            ("cooldown_ms", self.cooldown_ms),
            ("throttle_window_ms", self.throttle_window_ms),
            ("reset_interval_ms", self.reset_interval_ms),
            ("cache_ttl_ms", self.cache_ttl_ms),
        ];
        if let Some((name, _)) = windows.iter().find(|(_, ms)| *ms > MAX_WINDOW_MS) {
            return Err(ConfigError::Invalid(format!(
                "{name} exceeds {MAX_WINDOW_MS} ms"
            )));
        }
        Ok(())
    }

    pub fn into_config(self) -> Result<DispatcherConfig, ConfigError> {
        self.validate()?;
        Ok(DispatcherConfig {
            concurrency: self.concurrency,
            max_attempts: self.max_attempts,
            queue_capacity: self.queue_capacity,
            require_proxy: self.require_proxy,
            rotation: self.rotation,
            pacing: PacingConfig {
                min_delay: Duration::from_millis(self.min_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                jitter: Duration::from_millis(self.jitter_ms),
                throttle_delay: Duration::from_millis(self.throttle_delay_ms),
                backoff_base: Duration::from_millis(self.backoff_base_ms),
                backoff_cap: Duration::from_millis(self.backoff_cap_ms),
            },
            governor: GovernorConfig {
                max_errors: self.max_errors,
                cooldown: Duration::from_millis(self.cooldown_ms),
                throttle_window: Duration::from_millis(self.throttle_window_ms),
                throttle_threshold: self.throttle_threshold,
                history_limit: self.history_limit,
                reset_interval: Duration::from_millis(self.reset_interval_ms),
            },
            transport: TransportConfig {
                timeout: Duration::from_millis(self.timeout_ms),
                max_redirects: self.max_redirects,
                max_clients: self.max_clients,
            },
            cache_ttl: Duration::from_millis(self.cache_ttl_ms),
            enable_metrics: self.enable_metrics,
            rng_seed: self.rng_seed,
        })
    }
}
