// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-key circuit breakers.
//!
//! Protects the remote store from being hammered while it (or one user's
//! document) is failing. Each [`PreferenceKey`] gets its own breaker, so one
//! broken document does not block the others.
//!
//! States:
//! - Closed: Normal operation, requests pass through
//! - Open: Failing, requests fail fast until `next_retry_at`
//! - HalfOpen: Backoff elapsed, exactly one probe request is let through
//!
//! Backoff after opening is `initial_backoff * 2^(failures - 1)`, capped at
//! `max_backoff`. A failed probe re-opens with the backoff recomputed from
//! the new failure count.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::key::PreferenceKey;
use crate::remote::ErrorClass;

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakerPhase {
    #[default]
    Closed,
    Open,
    HalfOpen { probe_in_flight: bool },
}

/// Mutable state of one breaker.
#[derive(Debug, Clone, Default)]
pub struct BreakerState {
    pub phase: BreakerPhase,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub next_retry_at: Option<Instant>,
}

impl BreakerState {
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        match self.phase {
            BreakerPhase::Closed => CircuitState::Closed,
            BreakerPhase::Open => CircuitState::Open,
            BreakerPhase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

/// What a `record_*` call did to the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerTransition {
    Unchanged,
    /// The breaker just (re-)opened; cached data for the key's type is suspect
    Opened,
    Closed,
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Number of consecutive failures to trip the circuit
    pub failure_threshold: u32,
    /// Number of consecutive successes while open/half-open to close it
    pub success_threshold: u32,
    /// Backoff after the first trip
    pub initial_backoff: Duration,
    /// Upper bound for the exponential backoff
    pub max_backoff: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl BreakerConfig {
    /// Aggressive config (trips faster, recovers cautiously)
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 3,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
        }
    }

    /// Lenient config (tolerates more failures)
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_threshold: 10,
            success_threshold: 1,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(15),
        }
    }

    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(400),
        }
    }

    /// Backoff to apply when opening with `failures` consecutive failures.
    #[must_use]
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

/// Registry of breakers, one per preference key.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<PreferenceKey, BreakerState>,

    // Metrics
    rejections: AtomicU64,
    trips: AtomicU64,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
            rejections: AtomicU64::new(0),
            trips: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Whether a call for `key` must fail fast.
    ///
    /// An open breaker whose backoff has elapsed moves to half-open and lets
    /// this one caller through as the probe. Everyone else is refused until
    /// the probe is recorded.
    pub fn is_open(&self, key: &PreferenceKey) -> bool {
        let Some(mut state) = self.breakers.get_mut(key) else {
            return false;
        };

        let open = match state.phase {
            BreakerPhase::Closed => false,
            BreakerPhase::Open => {
                let due = state.next_retry_at.map_or(true, |at| Instant::now() >= at);
                if due {
                    state.phase = BreakerPhase::HalfOpen { probe_in_flight: true };
                    debug!(key = %key, "Circuit half-open, probing");
                    crate::metrics::record_circuit_call("probe");
                    false
                } else {
                    true
                }
            }
            BreakerPhase::HalfOpen { probe_in_flight: true } => true,
            BreakerPhase::HalfOpen { probe_in_flight: false } => {
                state.phase = BreakerPhase::HalfOpen { probe_in_flight: true };
                crate::metrics::record_circuit_call("probe");
                false
            }
        };
        drop(state);

        if open {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_circuit_call("rejected");
        }
        open
    }

    /// Record a failed call classified as `class`.
    pub fn record_failure(&self, key: &PreferenceKey, class: ErrorClass) -> BreakerTransition {
        if !class.counts_as_failure() {
            return BreakerTransition::Unchanged;
        }

        let threshold = self.config.failure_threshold;
        let transition = {
            let mut state = self.breakers.entry(key.clone()).or_default();
            state.consecutive_successes = 0;
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            if class.is_permanent() {
                state.consecutive_failures = state.consecutive_failures.max(threshold);
            }

            let was_half_open = matches!(state.phase, BreakerPhase::HalfOpen { .. });
            let failures = state.consecutive_failures;

            if was_half_open || failures >= threshold {
                let was_closed = state.phase == BreakerPhase::Closed;
                let backoff = self.config.backoff_for(failures);
                state.phase = BreakerPhase::Open;
                state.next_retry_at = Some(Instant::now() + backoff);

                if was_closed || was_half_open {
                    warn!(
                        key = %key,
                        failures,
                        class = class.as_str(),
                        backoff_ms = backoff.as_millis() as u64,
                        "Circuit opened"
                    );
                    BreakerTransition::Opened
                } else {
                    BreakerTransition::Unchanged
                }
            } else {
                debug!(key = %key, failures, class = class.as_str(), "Circuit call failed");
                BreakerTransition::Unchanged
            }
        };

        if transition == BreakerTransition::Opened {
            self.trips.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_circuit_transition("opened");
            crate::metrics::set_open_breakers(self.open_count());
        }
        transition
    }

    /// Record a successful call.
    pub fn record_success(&self, key: &PreferenceKey) -> BreakerTransition {
        let transition = {
            let Some(mut state) = self.breakers.get_mut(key) else {
                return BreakerTransition::Unchanged;
            };
            state.consecutive_successes = state.consecutive_successes.saturating_add(1);
            state.consecutive_failures = state.consecutive_failures.saturating_sub(1);

            match state.phase {
                BreakerPhase::Closed => BreakerTransition::Unchanged,
                BreakerPhase::Open | BreakerPhase::HalfOpen { .. }
                    if state.consecutive_successes >= self.config.success_threshold =>
                {
                    state.phase = BreakerPhase::Closed;
                    state.consecutive_failures = 0;
                    state.next_retry_at = None;
                    info!(key = %key, "Circuit closed");
                    BreakerTransition::Closed
                }
                BreakerPhase::HalfOpen { .. } => {
                    state.phase = BreakerPhase::HalfOpen { probe_in_flight: false };
                    BreakerTransition::Unchanged
                }
                BreakerPhase::Open => BreakerTransition::Unchanged,
            }
        };

        if transition == BreakerTransition::Closed {
            crate::metrics::record_circuit_transition("closed");
            crate::metrics::set_open_breakers(self.open_count());
        }
        transition
    }

    #[must_use]
    pub fn state(&self, key: &PreferenceKey) -> CircuitState {
        self.breakers
            .get(key)
            .map_or(CircuitState::Closed, |s| s.circuit_state())
    }

    #[must_use]
    pub fn snapshot(&self, key: &PreferenceKey) -> Option<BreakerState> {
        self.breakers.get(key).map(|s| s.clone())
    }

    /// Breakers currently open or half-open.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|s| s.phase != BreakerPhase::Closed)
            .count()
    }

    /// Get number of rejected calls
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Get number of closed-to-open transitions
    #[must_use]
    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    /// Forget every breaker belonging to `user_id`.
    pub fn clear_user(&self, user_id: &str) {
        self.breakers.retain(|k, _| k.user_id != user_id);
        crate::metrics::set_open_breakers(self.open_count());
    }

    pub fn clear(&self) {
        self.breakers.clear();
        crate::metrics::set_open_breakers(0);
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
