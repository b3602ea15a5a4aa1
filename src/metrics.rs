// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the counter cache.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `counter_cache_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: incr, get, del, store, mark_synced, try_evict, ...
//! - `status`: success, error
//! - `component`: store, scanner, scheduler
//! - `reason`: idle, capacity

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// FOREGROUND - incr / get / del
// ═══════════════════════════════════════════════════════════════════════════

/// Record a foreground operation outcome
pub fn record_operation(operation: &str, status: &str) {
    counter!(
        "counter_cache_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "counter_cache_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a seed load from the durable backend (cold incr or get)
pub fn record_seed_load() {
    counter!("counter_cache_seed_loads_total").increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// BACKGROUND - sync / evict
// ═══════════════════════════════════════════════════════════════════════════

/// Record a counter persisted and marked synced
pub fn record_synced() {
    counter!("counter_cache_synced_total").increment(1);
}

/// Record an eviction (`idle` or `capacity`)
pub fn record_evicted(reason: &str) {
    counter!(
        "counter_cache_evicted_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record an orphan sync-set member removed
pub fn record_orphan() {
    counter!("counter_cache_orphans_total").increment(1);
}

/// Record a full scan pass duration
pub fn record_scan_duration(duration: Duration) {
    histogram!("counter_cache_scan_seconds").record(duration.as_secs_f64());
}

/// Set a slot's cardinality as seen at the start of its scan
pub fn set_slot_items(slot: u32, count: u64) {
    gauge!(
        "counter_cache_slot_items",
        "slot" => slot.to_string()
    )
    .set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════

/// Record an error by component and operation
pub fn record_error(component: &str, operation: &str) {
    counter!(
        "counter_cache_errors_total",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Timer guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}
