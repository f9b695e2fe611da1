//! Structured observability hooks for the salience engine.
//!
//! This module provides:
//! - Run-scoped tracing spans via [`run_span`]
//! - Emission functions for lifecycle events: layer runs, per-topic failures,
//!   model calls, decay passes and scheduler decisions
//!
//! Events are emitted at `info!` level unless noted (filter with `RUST_LOG`).

use tracing::{info, warn, Span};

/// Run-scoped span. Attach with `tracing::Instrument` so every event inside
/// the run carries `run_id` and `layer`.
///
/// ```ignore
/// async { /* ... */ }.instrument(run_span("run-12345", "people")).await
/// ```
pub fn run_span(run_id: &str, layer: &str) -> Span {
    tracing::info_span!("salience.run", run_id = %run_id, layer = %layer)
}

pub fn emit_run_started(run_id: &str, layer: &str, targets: usize, dry_run: bool) {
    info!(
        event = "run.started",
        run_id = %run_id,
        layer = %layer,
        targets = targets,
        dry_run = dry_run,
    );
}

pub fn emit_run_finished(
    run_id: &str,
    status: &str,
    processed: usize,
    skipped: usize,
    insights: usize,
    duration_ms: u64,
) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        processed = processed,
        skipped = skipped,
        insights = insights,
        duration_ms = duration_ms,
    );
}

/// A topic failed inside a run; the batch continues (warning level).
pub fn emit_topic_failed(run_id: &str, topic: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.topic_failed", run_id = %run_id, topic = %topic, error = %error);
}

pub fn emit_model_call(profile: &str, model: &str, tokens: u64, latency_ms: u64, success: bool) {
    info!(
        event = "model.call",
        profile = %profile,
        model = %model,
        tokens = tokens,
        latency_ms = latency_ms,
        success = success,
    );
}

pub fn emit_decay_applied(domain: &str, topics: usize, total: f64) {
    info!(event = "ledger.decayed", domain = %domain, topics = topics, total = total);
}

pub fn emit_trigger_skipped(layer: &str, reason: &str) {
    info!(event = "scheduler.trigger_skipped", layer = %layer, reason = %reason);
}

/// Audit record write failed; the computation it describes is still returned (warning level).
pub fn emit_run_finalize_error(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.finalize_error", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_span_enter_does_not_panic() {
        let span = run_span("test-run-id", "people");
        let _entered = span.enter();
        emit_run_started("test-run-id", "people", 3, false);
    }
}
