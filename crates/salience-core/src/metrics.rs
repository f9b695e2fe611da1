//! Global atomic counters for salience observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a scheduler tick).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters: no allocations, no locking.
pub struct Metrics {
    earns: AtomicU64,
    propagations: AtomicU64,
    spillovers: AtomicU64,
    decay_entries: AtomicU64,
    model_calls: AtomicU64,
    model_failures: AtomicU64,
    runs_executed: AtomicU64,
    topics_failed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $read:ident, $field:ident) => {
        pub fn $inc(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($field), n, "counter incremented");
        }

        pub fn $read(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            earns: AtomicU64::new(0),
            propagations: AtomicU64::new(0),
            spillovers: AtomicU64::new(0),
            decay_entries: AtomicU64::new(0),
            model_calls: AtomicU64::new(0),
            model_failures: AtomicU64::new(0),
            runs_executed: AtomicU64::new(0),
            topics_failed: AtomicU64::new(0),
        }
    }

    counter!(add_earns, earns, earns);
    counter!(add_propagations, propagations, propagations);
    counter!(add_spillovers, spillovers, spillovers);
    counter!(add_decay_entries, decay_entries, decay_entries);
    counter!(add_model_calls, model_calls, model_calls);
    counter!(add_model_failures, model_failures, model_failures);
    counter!(add_runs_executed, runs_executed, runs_executed);
    counter!(add_topics_failed, topics_failed, topics_failed);

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            earns = self.earns(),
            propagations = self.propagations(),
            spillovers = self.spillovers(),
            decay_entries = self.decay_entries(),
            model_calls = self.model_calls(),
            model_failures = self.model_failures(),
            runs_executed = self.runs_executed(),
            topics_failed = self.topics_failed(),
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for c in [
            &self.earns,
            &self.propagations,
            &self.spillovers,
            &self.decay_entries,
            &self.model_calls,
            &self.model_failures,
            &self.runs_executed,
            &self.topics_failed,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.earns(), 0);
        m.add_earns(1);
        m.add_earns(2);
        assert_eq!(m.earns(), 3);

        m.add_model_failures(1);
        assert_eq!(m.model_failures(), 1);
        assert_eq!(m.model_calls(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.add_propagations(4);
        m.add_runs_executed(1);
        m.reset();
        assert_eq!(m.propagations(), 0);
        assert_eq!(m.runs_executed(), 0);
    }
}
