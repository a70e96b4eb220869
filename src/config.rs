use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::model::DeviceId;
use crate::outbox::OutboxConfig;
use crate::resolver::StatusPrecedence;
use crate::retry::RetryPolicy;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("config parse error: {0}")]
    Parse(String),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub device_id: DeviceId,
    pub drain_interval_ms: u64,
    pub inter_message_delay_ms: u64,
    pub send_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    /// Messages per frame; above 1 the drain sends batch frames.
    pub max_batch_size: usize,
    pub max_messages_per_drain: usize,
    pub retry: RetryPolicy,
    pub ledger_retention_days: u32,
    pub ledger_cleanup_interval_ms: u64,
    pub ledger_cache_size: usize,
    pub max_outbox_entries: usize,
    pub status_precedence: StatusPrecedence,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            device_id: DeviceId::generate(),
            drain_interval_ms: 1000,
            inter_message_delay_ms: 50,
            send_timeout_ms: 5000,
            ack_timeout_ms: 10_000,
            max_batch_size: 1,
            max_messages_per_drain: 100,
            retry: RetryPolicy::default(),
            ledger_retention_days: 30,
            ledger_cleanup_interval_ms: 60 * 60 * 1000,
            ledger_cache_size: 10_000,
            max_outbox_entries: 10_000,
            status_precedence: StatusPrecedence::default(),
        }
    }
}

impl SyncConfig {
    pub fn for_device(device_id: DeviceId) -> Self {
        Self {
            device_id,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.drain_interval_ms == 0 {
            return Err(invalid("drain_interval_ms", "must be > 0"));
        }
        if self.send_timeout_ms == 0 {
            return Err(invalid("send_timeout_ms", "must be > 0"));
        }
        if self.ack_timeout_ms < self.send_timeout_ms {
            return Err(invalid("ack_timeout_ms", "must be at least send_timeout_ms"));
        }
        if self.max_batch_size == 0 {
            return Err(invalid("max_batch_size", "must be > 0"));
        }
        if self.max_messages_per_drain == 0 {
            return Err(invalid("max_messages_per_drain", "must be > 0"));
        }
        if self.retry.base_delay_ms == 0 {
            return Err(invalid("retry.base_delay_ms", "must be > 0"));
        }
        if self.ledger_cleanup_interval_ms == 0 {
            return Err(invalid("ledger_cleanup_interval_ms", "must be > 0"));
        }
        if self.max_outbox_entries == 0 {
            return Err(invalid("max_outbox_entries", "must be > 0"));
        }

        let retention_ms = u64::from(self.ledger_retention_days).saturating_mul(DAY_MS);
        let horizon = self.retry_horizon();
        if u128::from(retention_ms) <= horizon.as_millis() {
            return Err(invalid(
                "ledger_retention_days",
                format!("retention must outlast the retry horizon of {horizon:?}"),
            ));
        }
        Ok(())
    }

    /// Longest time a message can keep being redelivered before escalation.
    #[must_use]
    pub fn retry_horizon(&self) -> Duration {
        let backoff: Duration = (0..self.retry.max_retries).map(|n| self.retry.delay(n)).sum();
        let attempts = self.retry.max_retries.saturating_add(1);
        backoff + self.ack_timeout() * attempts
    }

    #[must_use]
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    #[must_use]
    pub fn inter_message_delay(&self) -> Duration {
        Duration::from_millis(self.inter_message_delay_ms)
    }

    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    #[must_use]
    pub fn ledger_retention(&self) -> Duration {
        Duration::from_millis(u64::from(self.ledger_retention_days).saturating_mul(DAY_MS))
    }

    #[must_use]
    pub fn ledger_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.ledger_cleanup_interval_ms)
    }

    #[must_use]
    pub fn outbox_config(&self) -> OutboxConfig {
        OutboxConfig {
            max_entries: self.max_outbox_entries,
            retry: self.retry,
        }
    }
}
