// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the preference sync engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `pref_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: memory, durable, remote, defaults
//! - `op`: fetch, persist, replay
//! - `status`: success, error, not_found, rejected

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════
// CACHE - Tier hits and misses
// ═══════════════════════════════════════════════════════════════════════════

/// Record a cache read outcome (`hit`, `stale`, `miss`)
pub fn record_cache_read(tier: &str, outcome: &str) {
    counter!(
        "pref_sync_cache_reads_total",
        "tier" => tier.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record which source finally answered a read
pub fn record_read_source(source: &str) {
    counter!(
        "pref_sync_read_source_total",
        "source" => source.to_string()
    )
    .increment(1);
}

/// Set memory tier entry count
pub fn set_memory_entries(count: usize) {
    gauge!("pref_sync_memory_entries").set(count as f64);
}

/// Record a durable tier write that could not be stored anywhere
pub fn record_durable_write_failure() {
    counter!("pref_sync_durable_write_failures_total").increment(1);
}

/// Record data corruption detection
pub fn record_corruption(key: &str) {
    counter!(
        "pref_sync_corruption_detected_total",
        "key" => key.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// REMOTE - Calls to the authoritative store
// ═══════════════════════════════════════════════════════════════════════════

/// Record a remote call outcome
pub fn record_remote_operation(op: &str, status: &str) {
    counter!(
        "pref_sync_remote_operations_total",
        "op" => op.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record remote call latency
pub fn record_remote_latency(op: &str, duration: Duration) {
    histogram!(
        "pref_sync_remote_seconds",
        "op" => op.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKER - Resilience metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Record circuit breaker call outcome (`allowed`, `rejected`, `probe`)
pub fn record_circuit_call(outcome: &str) {
    counter!(
        "pref_sync_circuit_breaker_calls_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record circuit breaker transition (`opened`, `closed`)
pub fn record_circuit_transition(transition: &str) {
    counter!(
        "pref_sync_circuit_breaker_transitions_total",
        "transition" => transition.to_string()
    )
    .increment(1);
}

/// Set the number of breakers currently open or half-open
pub fn set_open_breakers(count: usize) {
    gauge!("pref_sync_circuit_breakers_open").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// COALESCING - Deduplicated work
// ═══════════════════════════════════════════════════════════════════════════

/// Record a read that joined an in-flight fetch instead of starting one
pub fn record_coalesced_read() {
    counter!("pref_sync_coalesced_reads_total").increment(1);
}

/// Record a debounced write that replaced a pending snapshot
pub fn record_coalesced_write() {
    counter!("pref_sync_coalesced_writes_total").increment(1);
}

/// Record a save skipped because nothing changed
pub fn record_unchanged_save() {
    counter!("pref_sync_unchanged_saves_total").increment(1);
}

/// Record which reconcile mode a save used
pub fn record_reconcile(mode: &str, validated: bool) {
    counter!(
        "pref_sync_reconcile_total",
        "mode" => mode.to_string(),
        "validated" => if validated { "true" } else { "false" }
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// OFFLINE QUEUE - Pending work
// ═══════════════════════════════════════════════════════════════════════════

/// Set offline queue depth
pub fn set_queue_depth(count: usize) {
    gauge!("pref_sync_queue_entries").set(count as f64);
}

/// Record an enqueue attempt
pub fn record_enqueue(status: &str) {
    counter!(
        "pref_sync_queue_enqueued_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record queue drain operation
pub fn record_queue_drain(replayed: usize, failed: usize) {
    let status = if failed == 0 { "success" } else { "partial" };
    counter!(
        "pref_sync_queue_drain_total",
        "status" => status
    )
    .increment(1);
    counter!("pref_sync_queue_replayed_items_total").increment(replayed as u64);
    counter!("pref_sync_queue_failed_items_total").increment(failed as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// NOTIFY - Change bus
// ═══════════════════════════════════════════════════════════════════════════

/// Record one tick flush delivering `events` to `listeners`
pub fn record_notify_flush(events: usize, listeners: usize) {
    counter!("pref_sync_notify_flushes_total").increment(1);
    counter!("pref_sync_notify_events_total").increment(events as u64);
    histogram!("pref_sync_notify_listeners").record(listeners as f64);
}

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "pref_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}
