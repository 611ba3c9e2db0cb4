//! Configuration for the preference sync engine.
//!
//! # Example
//!
//! ```
//! use pref_sync_engine::PrefSyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = PrefSyncConfig::default();
//! assert_eq!(config.memory_ttl_ms, 5 * 60 * 1000); // 5 minutes
//!
//! // Tuned config
//! let config = PrefSyncConfig {
//!     debounce_ms: 250,
//!     breaker_failure_threshold: 5,
//!     ..Default::default()
//! };
//! assert_eq!(config.debounce().as_millis(), 250);
//! ```

use serde::Deserialize;
use std::time::Duration;

use crate::resilience::circuit_breaker::BreakerConfig;

/// Configuration for the preference sync engine.
///
/// All fields have sensible defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct PrefSyncConfig {
    /// Memory tier freshness window (default: 5 minutes)
    #[serde(default = "default_memory_ttl_ms")]
    pub memory_ttl_ms: u64,

    /// Durable tier entries older than this are served only as a fallback (default: 7 days)
    #[serde(default = "default_durable_max_age_ms")]
    pub durable_max_age_ms: u64,

    /// At most one background refresh per key per window (default: 30s)
    #[serde(default = "default_refresh_throttle_ms")]
    pub refresh_throttle_ms: u64,

    /// Serialized entries above this go to the large-object store (default: 64 KB)
    #[serde(default = "default_small_object_max_bytes")]
    pub small_object_max_bytes: usize,

    /// Debounce window for non-critical writes
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Change notification coalescing tick (one frame)
    #[serde(default = "default_notify_tick_ms")]
    pub notify_tick_ms: u64,

    /// Circuit breaker settings
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_success_threshold")]
    pub breaker_success_threshold: u32,
    #[serde(default = "default_breaker_initial_backoff_ms")]
    pub breaker_initial_backoff_ms: u64,
    #[serde(default = "default_breaker_max_backoff_ms")]
    pub breaker_max_backoff_ms: u64,

    /// Offline queue capacity before enqueue is refused
    #[serde(default = "default_queue_max_items")]
    pub queue_max_items: usize,

    /// Key namespace for offline queue entries
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    /// Key namespace for durable cache entries
    #[serde(default = "default_cache_prefix")]
    pub cache_prefix: String,
}

fn default_memory_ttl_ms() -> u64 { 5 * 60 * 1000 }
fn default_durable_max_age_ms() -> u64 { 7 * 24 * 60 * 60 * 1000 }
fn default_refresh_throttle_ms() -> u64 { 30_000 }
fn default_small_object_max_bytes() -> usize { 64 * 1024 } // 64 KB
fn default_debounce_ms() -> u64 { 1000 }
fn default_notify_tick_ms() -> u64 { 16 }
fn default_breaker_failure_threshold() -> u32 { 3 }
fn default_breaker_success_threshold() -> u32 { 2 }
fn default_breaker_initial_backoff_ms() -> u64 { 1000 }
fn default_breaker_max_backoff_ms() -> u64 { 60_000 }
fn default_queue_max_items() -> usize { 1000 }
fn default_queue_prefix() -> String { "pref_queue:".to_string() }
fn default_cache_prefix() -> String { "pref:".to_string() }

impl Default for PrefSyncConfig {
    fn default() -> Self {
        Self {
            memory_ttl_ms: default_memory_ttl_ms(),
            durable_max_age_ms: default_durable_max_age_ms(),
            refresh_throttle_ms: default_refresh_throttle_ms(),
            small_object_max_bytes: default_small_object_max_bytes(),
            debounce_ms: default_debounce_ms(),
            notify_tick_ms: default_notify_tick_ms(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_success_threshold: default_breaker_success_threshold(),
            breaker_initial_backoff_ms: default_breaker_initial_backoff_ms(),
            breaker_max_backoff_ms: default_breaker_max_backoff_ms(),
            queue_max_items: default_queue_max_items(),
            queue_prefix: default_queue_prefix(),
            cache_prefix: default_cache_prefix(),
        }
    }
}

impl PrefSyncConfig {
    #[must_use]
    pub fn memory_ttl(&self) -> Duration {
        Duration::from_millis(self.memory_ttl_ms)
    }

    #[must_use]
    pub fn durable_max_age(&self) -> Duration {
        Duration::from_millis(self.durable_max_age_ms)
    }

    #[must_use]
    pub fn refresh_throttle(&self) -> Duration {
        Duration::from_millis(self.refresh_throttle_ms)
    }

    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    #[must_use]
    pub fn notify_tick(&self) -> Duration {
        Duration::from_millis(self.notify_tick_ms)
    }

    /// Breaker thresholds and backoff as a [`BreakerConfig`].
    #[must_use]
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_failure_threshold.max(1),
            success_threshold: self.breaker_success_threshold.max(1),
            initial_backoff: Duration::from_millis(self.breaker_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.breaker_max_backoff_ms),
        }
    }
}
