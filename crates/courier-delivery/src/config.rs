//! Delivery configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use courier_core::DeliveryPath;

/// Delivery core configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Budget for one direct attempt (milliseconds)
    pub direct_timeout_ms: u64,
    /// Budget for one relay attempt or server deposit (milliseconds)
    pub relay_timeout_ms: u64,
    /// Live-path attempts per message before it only goes to the offline queue
    pub max_live_attempts: u32,
    /// Offline queue retention (seconds)
    pub offline_ttl_secs: u64,
    /// How long Delivered and Failed envelopes are kept (seconds)
    pub envelope_retention_secs: u64,
    /// Skip window of the ratchet
    pub max_skipped_messages: u32,
    /// Interval of the background purge (seconds)
    pub purge_interval_secs: u64,
    /// Received message ids remembered for duplicate suppression
    pub seen_cache_size: usize,
    /// One-time prekeys kept available for new handshakes
    pub prekey_pool_size: usize,
    /// Refill the pool when fewer than this many remain
    pub prekey_refill_threshold: usize,
    /// Backoff for redelivery after a contact comes online
    pub retry: RetryConfig,
    /// Where sessions and queues are persisted
    pub storage: StorageConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            direct_timeout_ms: 5_000,
            relay_timeout_ms: 8_000,
            max_live_attempts: 3,
            offline_ttl_secs: courier_core::DEFAULT_OFFLINE_TTL_SECS,
            envelope_retention_secs: 7 * 24 * 3600,
            max_skipped_messages: courier_crypto::DEFAULT_MAX_SKIP,
            purge_interval_secs: 3600,
            seen_cache_size: 4096,
            prekey_pool_size: 100,
            prekey_refill_threshold: 20,
            retry: RetryConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl DeliveryConfig {
    /// Persist under `path`
    pub fn with_storage_path(path: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                path: Some(path.into()),
            },
            ..Default::default()
        }
    }

    /// Direct attempt timeout
    pub fn direct_timeout(&self) -> Duration {
        Duration::from_millis(self.direct_timeout_ms)
    }

    /// Relay attempt timeout
    pub fn relay_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_timeout_ms)
    }

    /// Timeout for a transmit on `path`; deposits share the relay budget
    pub fn timeout_for(&self, path: DeliveryPath) -> Duration {
        match path {
            DeliveryPath::Direct => self.direct_timeout(),
            DeliveryPath::Relay | DeliveryPath::StoreAndForward => self.relay_timeout(),
        }
    }

    /// Offline queue retention
    pub fn offline_ttl(&self) -> Duration {
        Duration::from_secs(self.offline_ttl_secs)
    }

    /// Retention of finished envelopes
    pub fn envelope_retention(&self) -> Duration {
        Duration::from_secs(self.envelope_retention_secs)
    }

    /// Background purge interval
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.direct_timeout_ms == 0 || self.relay_timeout_ms == 0 {
            return Err("path timeouts must be greater than 0".to_string());
        }
        if self.offline_ttl_secs == 0 {
            return Err("offline_ttl_secs must be greater than 0".to_string());
        }
        if self.envelope_retention_secs == 0 {
            return Err("envelope_retention_secs must be greater than 0".to_string());
        }
        if self.max_skipped_messages == 0 {
            return Err("max_skipped_messages must be greater than 0".to_string());
        }
        if self.purge_interval_secs == 0 {
            return Err("purge_interval_secs must be greater than 0".to_string());
        }
        if self.prekey_refill_threshold > self.prekey_pool_size {
            return Err("prekey_refill_threshold must not exceed prekey_pool_size".to_string());
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err("retry.backoff_multiplier must be at least 1.0".to_string());
        }
        Ok(())
    }
}

/// Retry configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Redelivery rounds after the first one on wake
    pub max_retries: u32,
    /// Initial retry delay (milliseconds)
    pub initial_delay_ms: u64,
    /// Maximum retry delay (milliseconds)
    pub max_delay_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate delay for retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let delay = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }
}

/// Storage configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// sled database directory; in-memory when unset
    pub path: Option<PathBuf>,
}
