//! Metrics registration, following the teacher's use of the `metrics` facade
//! (see `performance::PerformanceProfiler` in the original codebase — we keep
//! the crate, drop the trading-specific profiler).

use metrics::{counter, gauge, histogram};

pub fn record_kill_switch_trigger(reason: &str) {
    counter!("escrow_core_kill_switch_triggers_total", "reason" => reason.to_string())
        .increment(1);
}

pub fn record_saga_phase(event_type: &str, phase: &str, outcome: &str) {
    counter!(
        "escrow_core_saga_phase_total",
        "event_type" => event_type.to_string(),
        "phase" => phase.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_saga_latency_ms(event_type: &str, millis: f64) {
    histogram!("escrow_core_saga_latency_ms", "event_type" => event_type.to_string())
        .record(millis);
}

pub fn set_dlq_depth(depth: f64) {
    gauge!("escrow_core_dlq_depth").set(depth);
}

pub fn record_tpee_decision(decision: &str) {
    counter!("escrow_core_tpee_decisions_total", "decision" => decision.to_string()).increment(1);
}

pub fn record_ingress_drop(guard: &str) {
    counter!("escrow_core_ingress_drops_total", "guard" => guard.to_string()).increment(1);
}
