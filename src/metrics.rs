use crate::controllers::workloads::RestartDecision;
use crate::resources::WorkloadKind;
use crate::Error;
use prometheus::{
    histogram_opts, opts, Histogram, HistogramTimer, HistogramVec, IntCounter, IntCounterVec,
    Registry,
};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub decisions: IntCounterVec,
    pub webhook_requests: IntCounterVec,
    pub webhook_duration: Histogram,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "sidecar_drift_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["kind"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "sidecar_drift_reconciliation_errors_total",
                "reconciliation errors",
            ),
            &["kind", "instance", "error"],
        )
        .unwrap();
        let reconciliations =
            IntCounter::new("sidecar_drift_reconciliations_total", "reconciliations").unwrap();
        let decisions = IntCounterVec::new(
            opts!(
                "sidecar_drift_decisions_total",
                "restart decisions taken by reconcile passes",
            ),
            &["kind", "decision"],
        )
        .unwrap();
        let webhook_requests = IntCounterVec::new(
            opts!(
                "sidecar_drift_webhook_requests_total",
                "desired image lookups by outcome",
            ),
            &["outcome"],
        )
        .unwrap();
        let webhook_duration = Histogram::with_opts(
            histogram_opts!(
                "sidecar_drift_webhook_duration_seconds",
                "The duration of injection webhook calls in seconds"
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1., 2., 5., 10.]),
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            decisions,
            webhook_requests,
            webhook_duration,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.decisions.clone()))?;
        registry.register(Box::new(self.webhook_requests.clone()))?;
        registry.register(Box::new(self.webhook_duration.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, kind: WorkloadKind, instance: &str, e: &Error) {
        self.failures
            .with_label_values(&[kind.as_str(), instance, e.metric_label()])
            .inc()
    }

    pub fn decision(&self, kind: WorkloadKind, decision: RestartDecision) {
        self.decisions
            .with_label_values(&[kind.as_str(), decision.as_str()])
            .inc()
    }

    /// `outcome` is one of `ok`, `cached`, `invalid` or `unavailable`
    pub fn webhook_request(&self, outcome: &str) {
        self.webhook_requests.with_label_values(&[outcome]).inc()
    }

    pub fn measure_webhook(&self) -> HistogramTimer {
        self.webhook_duration.start_timer()
    }

    pub fn count_and_measure(&self, kind: WorkloadKind) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            kind,
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    kind: WorkloadKind,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.kind.as_str()])
            .observe(duration);
    }
}
