//! Prometheus metrics for the Machine Controller.

use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};
use std::time::Duration;

/// Reconcile counters and timings, registered on a shared `Registry`.
#[derive(Clone)]
pub struct Metrics {
    reconciles: IntCounterVec,
    reconcile_duration: Histogram,
    /// Number of provider kinds with an installed watch
    pub watched_kinds: IntGauge,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("watched_kinds", &self.watched_kinds.get())
            .finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create the metrics and register them.
    ///
    /// # Errors
    ///
    /// Fails if a metric with the same name is already registered.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let reconciles = IntCounterVec::new(
            Opts::new("machine_reconcile_total", "Machine reconciliation passes by result"),
            &["result"],
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new("machine_reconcile_duration_seconds", "Duration of Machine reconciliation passes")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;
        let watched_kinds = IntGauge::new(
            "machine_watched_provider_kinds",
            "Provider kinds the controller has installed a watch for",
        )?;

        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(watched_kinds.clone()))?;

        Ok(Self {
            reconciles,
            reconcile_duration,
            watched_kinds,
        })
    }

    /// Record one finished pass. `result` is "success", "requeue" or "error".
    pub fn observe(&self, result: &str, elapsed: Duration) {
        self.reconciles.with_label_values(&[result]).inc();
        self.reconcile_duration.observe(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_counts_by_result() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).unwrap();

        metrics.observe("success", Duration::from_millis(20));
        metrics.observe("error", Duration::from_millis(5));
        metrics.observe("success", Duration::from_millis(7));

        assert_eq!(metrics.reconciles.with_label_values(&["success"]).get(), 2);
        assert_eq!(metrics.reconciles.with_label_values(&["error"]).get(), 1);
        assert_eq!(metrics.reconcile_duration.get_sample_count(), 3);
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        Metrics::new(&registry).unwrap();
        assert!(Metrics::new(&registry).is_err());
    }
}
