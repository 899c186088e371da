//! Metrics Module
//!
//! Counters and gauges for the matching and settlement hot path, recorded
//! through the `metrics` facade. Exporter wiring is an external concern;
//! without one installed the macros are no-ops.

#![allow(dead_code)]

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency
pub mod names {
    // Order lifecycle
    pub const ORDERS_PLACED_TOTAL: &str = "orders_placed_total";
    pub const ORDERS_REJECTED_TOTAL: &str = "orders_rejected_total";
    pub const ORDERS_CANCELLED_TOTAL: &str = "orders_cancelled_total";

    // Matching engine
    pub const MATCH_CYCLES_TOTAL: &str = "match_cycles_total";
    pub const MATCHES_FOUND_TOTAL: &str = "matches_found_total";
    pub const MATCH_CYCLE_DURATION_SECONDS: &str = "match_cycle_duration_seconds";
    pub const MATCHING_POLL_INTERVAL_MS: &str = "matching_poll_interval_ms";

    // Settlement
    pub const SETTLEMENTS_TOTAL: &str = "settlements_total";
    pub const SETTLEMENTS_PARTIAL_TOTAL: &str = "settlements_partial_total";
    pub const SETTLEMENTS_FAILED_TOTAL: &str = "settlements_failed_total";
    pub const ALLOCATION_LEGS_SKIPPED_DUST_TOTAL: &str = "allocation_legs_skipped_dust_total";

    // Stop-loss
    pub const STOP_LOSS_REGISTERED_TOTAL: &str = "stop_loss_registered_total";
    pub const STOP_LOSS_TRIGGERED_TOTAL: &str = "stop_loss_triggered_total";

    // Read model
    pub const READ_MODEL_CONTRACTS: &str = "read_model_contracts";
    pub const READ_MODEL_RECONNECTS_TOTAL: &str = "read_model_reconnects_total";
    pub const READ_MODEL_REST_FALLBACKS_TOTAL: &str = "read_model_rest_fallbacks_total";

    // Trade cache
    pub const TRADE_CACHE_FLUSHES_TOTAL: &str = "trade_cache_flushes_total";
}

/// Label keys
pub mod labels {
    pub const PAIR: &str = "pair";
    pub const SIDE: &str = "side";
    pub const MODE: &str = "mode";
    pub const REASON: &str = "reason";
    pub const TEMPLATE: &str = "template";
    pub const LEG: &str = "leg";
}

pub fn record_order_placed(pair: &str, side: &str, mode: &str) {
    counter!(names::ORDERS_PLACED_TOTAL,
        labels::PAIR => pair.to_string(),
        labels::SIDE => side.to_string(),
        labels::MODE => mode.to_string()
    )
    .increment(1);
}

pub fn record_order_rejected(reason: &str) {
    counter!(names::ORDERS_REJECTED_TOTAL, labels::REASON => reason.to_string()).increment(1);
}

pub fn record_order_cancelled(pair: &str) {
    counter!(names::ORDERS_CANCELLED_TOTAL, labels::PAIR => pair.to_string()).increment(1);
}

pub fn record_match_cycle(duration_secs: f64, matched: bool) {
    counter!(names::MATCH_CYCLES_TOTAL).increment(1);
    histogram!(names::MATCH_CYCLE_DURATION_SECONDS).record(duration_secs);
    if matched {
        counter!(names::MATCHES_FOUND_TOTAL).increment(1);
    }
}

pub fn record_poll_interval(ms: u64) {
    gauge!(names::MATCHING_POLL_INTERVAL_MS).set(ms as f64);
}

pub fn record_settlement(pair: &str) {
    counter!(names::SETTLEMENTS_TOTAL, labels::PAIR => pair.to_string()).increment(1);
}

pub fn record_partial_settlement(pair: &str, leg: &str) {
    counter!(names::SETTLEMENTS_PARTIAL_TOTAL,
        labels::PAIR => pair.to_string(),
        labels::LEG => leg.to_string()
    )
    .increment(1);
}

pub fn record_settlement_failed(pair: &str) {
    counter!(names::SETTLEMENTS_FAILED_TOTAL, labels::PAIR => pair.to_string()).increment(1);
}

pub fn record_dust_skip(leg: &str) {
    counter!(names::ALLOCATION_LEGS_SKIPPED_DUST_TOTAL, labels::LEG => leg.to_string())
        .increment(1);
}

pub fn record_stop_registered(pair: &str) {
    counter!(names::STOP_LOSS_REGISTERED_TOTAL, labels::PAIR => pair.to_string()).increment(1);
}

pub fn record_stop_triggered(pair: &str) {
    counter!(names::STOP_LOSS_TRIGGERED_TOTAL, labels::PAIR => pair.to_string()).increment(1);
}

pub fn record_read_model_size(template: &str, count: usize) {
    gauge!(names::READ_MODEL_CONTRACTS, labels::TEMPLATE => template.to_string())
        .set(count as f64);
}

pub fn record_read_model_reconnect() {
    counter!(names::READ_MODEL_RECONNECTS_TOTAL).increment(1);
}

pub fn record_rest_fallback() {
    counter!(names::READ_MODEL_REST_FALLBACKS_TOTAL).increment(1);
}

pub fn record_cache_flush() {
    counter!(names::TRADE_CACHE_FLUSHES_TOTAL).increment(1);
}
