//! Resilience: per-key circuit breakers and the offline replay queue.

pub mod circuit_breaker;
pub mod offline_queue;
