//! Configuration for the debounce coordinator.
//!
//! Follows the same layering as the rest of the platform: serde defaults for
//! every tunable, a `validate()` gate that rejects bad values before any
//! store interaction, and `load()` combining optional config files with
//! `COALESCE__`-prefixed environment variables.

use crate::error::BufferError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Named flush policy applied when a buffer's debounce window elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlushPattern {
    /// Flush everything, retain nothing.
    #[default]
    CollectSend,
    /// Flush the first `max_size` messages in arrival order, retain the rest.
    Throttle,
    /// Flush a fixed half-capacity chunk (`ceil(max_size / 2)`).
    Batch,
    /// Flush messages at or above the priority threshold, retain the rest.
    Priority,
}

impl FlushPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushPattern::CollectSend => "collect_send",
            FlushPattern::Throttle => "throttle",
            FlushPattern::Batch => "batch",
            FlushPattern::Priority => "priority",
        }
    }
}

impl FromStr for FlushPattern {
    type Err = BufferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collect_send" => Ok(FlushPattern::CollectSend),
            "throttle" => Ok(FlushPattern::Throttle),
            "batch" => Ok(FlushPattern::Batch),
            "priority" => Ok(FlushPattern::Priority),
            other => Err(BufferError::ConfigurationInvalid(format!(
                "unknown flush pattern '{}'",
                other
            ))),
        }
    }
}

/// Main configuration for a [`DebounceCoordinator`](crate::DebounceCoordinator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebounceConfig {
    /// Flush policy applied when the window elapses.
    #[serde(default)]
    pub pattern: FlushPattern,
    /// Maximum buffered messages before a size-triggered flush. Must be > 0.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Debounce window: how long a buffer waits after its most recent
    /// contribution before flushing. Fractional seconds are allowed so
    /// sub-second windows are expressible. Must be > 0.
    #[serde(default = "default_debounce_window_secs")]
    pub debounce_window_secs: f64,
    /// Number of priority levels for the `priority` pattern. Must be >= 1.
    /// The flush threshold is `priority_levels - 1`.
    #[serde(default = "default_priority_levels")]
    pub priority_levels: u32,
    /// Record accepted messages and flush events in the audit log.
    #[serde(default = "default_true")]
    pub enable_audit_log: bool,
    /// Maximum audit log entries retained per buffer; oldest dropped first.
    #[serde(default = "default_audit_log_max_length")]
    pub audit_log_max_length: u64,
    /// Prefix for every key written to the backing store.
    #[serde(default = "default_key_namespace")]
    pub key_namespace: String,
    /// Sleep increment of the master poll loop. Must be > 0.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Safety margin added on top of the remaining window when computing the
    /// TTL for stored state, so abandoned buffers self-expire instead of
    /// leaking.
    #[serde(default = "default_ttl_margin_secs")]
    pub ttl_margin_secs: u64,
    /// Budget for transparently retrying transient store reads during a
    /// master poll before surfacing the failure.
    #[serde(default = "default_store_retry_budget_ms")]
    pub store_retry_budget_ms: u64,
}

// Default value functions
fn default_max_size() -> usize {
    10
}

fn default_debounce_window_secs() -> f64 {
    2.0
}

fn default_priority_levels() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_audit_log_max_length() -> u64 {
    1000
}

fn default_key_namespace() -> String {
    "coalesce".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_ttl_margin_secs() -> u64 {
    60
}

fn default_store_retry_budget_ms() -> u64 {
    5000
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            pattern: FlushPattern::default(),
            max_size: default_max_size(),
            debounce_window_secs: default_debounce_window_secs(),
            priority_levels: default_priority_levels(),
            enable_audit_log: default_true(),
            audit_log_max_length: default_audit_log_max_length(),
            key_namespace: default_key_namespace(),
            poll_interval_ms: default_poll_interval_ms(),
            ttl_margin_secs: default_ttl_margin_secs(),
            store_retry_budget_ms: default_store_retry_budget_ms(),
        }
    }
}

impl DebounceConfig {
    /// Load configuration from config files and environment variables.
    ///
    /// Sources, later ones overriding earlier ones:
    /// 1. `config/coalesce.{toml,yaml,json}` relative to the working dir
    /// 2. `/etc/coalesce/coalesce.{toml,yaml,json}`
    /// 3. `COALESCE__`-prefixed environment variables
    ///    (`COALESCE__MAX_SIZE`, `COALESCE__KEY_NAMESPACE`, ...)
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/coalesce").required(false))
            .add_source(config::File::with_name("/etc/coalesce/coalesce").required(false))
            .add_source(
                config::Environment::with_prefix("COALESCE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. Invalid settings are rejected here and
    /// never reach the backing store.
    pub fn validate(&self) -> Result<(), BufferError> {
        if self.max_size == 0 {
            return Err(BufferError::ConfigurationInvalid(
                "max_size must be greater than zero".to_string(),
            ));
        }
        if !(self.debounce_window_secs > 0.0) {
            return Err(BufferError::ConfigurationInvalid(
                "debounce_window_secs must be greater than zero".to_string(),
            ));
        }
        if self.priority_levels == 0 {
            return Err(BufferError::ConfigurationInvalid(
                "priority_levels must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(BufferError::ConfigurationInvalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.key_namespace.is_empty() {
            return Err(BufferError::ConfigurationInvalid(
                "key_namespace must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the debounce window as a Duration.
    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs_f64(self.debounce_window_secs)
    }

    /// Get the poll loop sleep increment as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get the store retry budget as a Duration.
    pub fn store_retry_budget(&self) -> Duration {
        Duration::from_millis(self.store_retry_budget_ms)
    }

    /// TTL to write alongside state that must stay alive for `remaining`.
    pub fn state_ttl(&self, remaining: Duration) -> Duration {
        remaining + Duration::from_secs(self.ttl_margin_secs)
    }

    /// Store key holding the buffer state for `buffer_id`.
    pub fn buffer_key(&self, buffer_id: &str) -> String {
        format!("{}:buffer:{}", self.key_namespace, buffer_id)
    }

    /// Store key holding the cooperative cancellation flag for `buffer_id`.
    pub fn cancel_key(&self, buffer_id: &str) -> String {
        format!("{}:cancel:{}", self.key_namespace, buffer_id)
    }

    /// Store key holding the audit log for `buffer_id`.
    pub fn audit_key(&self, buffer_id: &str) -> String {
        format!("{}:audit:{}", self.key_namespace, buffer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DebounceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pattern, FlushPattern::CollectSend);
        assert_eq!(config.max_size, 10);
    }

    #[test]
    fn test_zero_max_size_rejected() {
        let config = DebounceConfig {
            max_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BufferError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn test_zero_window_rejected() {
        let config = DebounceConfig {
            debounce_window_secs: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_priority_levels_rejected() {
        let config = DebounceConfig {
            priority_levels: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_pattern_rejected() {
        assert!("collect_send".parse::<FlushPattern>().is_ok());
        assert!("fanout".parse::<FlushPattern>().is_err());
    }

    #[test]
    fn test_key_builders_use_namespace() {
        let config = DebounceConfig {
            key_namespace: "chat".to_string(),
            ..Default::default()
        };
        assert_eq!(config.buffer_key("conv-1"), "chat:buffer:conv-1");
        assert_eq!(config.cancel_key("conv-1"), "chat:cancel:conv-1");
        assert_eq!(config.audit_key("conv-1"), "chat:audit:conv-1");
    }

    #[test]
    fn test_state_ttl_exceeds_window() {
        let config = DebounceConfig::default();
        let remaining = config.debounce_window();
        assert!(config.state_ttl(remaining) > remaining);
    }
}
