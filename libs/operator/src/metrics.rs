use crate::error::Error;

use std::sync::Arc;

use kube::ResourceExt;
use opentelemetry::trace::TraceId;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::exemplar::HistogramWithExemplars;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconcile: ReconcileMetrics,
    triggered: Family<TriggerLabels, Counter>,
    watch_failures: Counter,
    ready: Gauge,
}

impl Metrics {
    pub fn new(registry: &mut Registry) -> Self {
        let reconcile =
            ReconcileMetrics::default().register(registry.sub_registry_with_prefix("reconcile"));
        let triggered = Family::<TriggerLabels, Counter>::default();
        registry.register(
            "triggered",
            "reconciliations triggered by dependent resource events",
            triggered.clone(),
        );
        let watch_failures = Counter::default();
        registry.register(
            "watch_operations_failed",
            "watch operation errors",
            watch_failures.clone(),
        );
        let ready = Gauge::default();
        registry.register("ready", "controller readiness", ready.clone());
        Metrics {
            reconcile,
            triggered,
            watch_failures,
            ready,
        }
    }

    pub fn triggered_inc(&self, action: TriggerAction, kind: &str) {
        self.triggered
            .get_or_create(&TriggerLabels {
                action,
                kind: kind.to_string(),
            })
            .inc();
    }

    pub fn watch_failures_inc(&self) {
        self.watch_failures.inc();
    }

    pub fn ready_set(&self, ready: i64) {
        self.ready.set(ready);
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum TriggerAction {
    Apply,
    Delete,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TriggerLabels {
    pub action: TriggerAction,
    pub kind: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub id: String,
}

impl TryFrom<&TraceId> for TraceLabel {
    type Error = Error;

    fn try_from(id: &TraceId) -> Result<TraceLabel, Self::Error> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(Error::InvalidTraceId)
        } else {
            Ok(Self { id: id.to_string() })
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub instance: String,
    pub error: String,
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Family<(), Counter>,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: HistogramWithExemplars<TraceLabel>,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            runs: Family::<(), Counter>::default(),
            failures: Family::<ErrorLabels, Counter>::default(),
            duration: HistogramWithExemplars::new([0.1, 0.5, 1., 5., 10.].into_iter()),
        }
    }
}

impl ReconcileMetrics {
    pub fn register(self, registry: &mut Registry) -> Self {
        registry.register_with_unit(
            "duration",
            "reconcile duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        registry.register("failures", "reconciliation errors", self.failures.clone());
        registry.register("runs", "reconciliations", self.runs.clone());
        self
    }

    pub fn set_failure<K: ResourceExt>(&self, obj: &Arc<K>, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                instance: obj.name_any(),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_and_measure(&self, trace_id: &TraceId) -> ReconcileMeasurer {
        self.runs.get_or_create(&()).inc();
        ReconcileMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: self.duration.clone(),
        }
    }
}

/// Relies on Drop to record the reconcile duration with the trace
/// exemplar, whichever way the reconcile ends.
pub struct ReconcileMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = self.labels.take();
        self.metric.observe(duration, labels);
    }
}
