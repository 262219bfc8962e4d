//! Metrics façade.
//!
//! The sequencer observes its checkpoints through typed instrument traits
//! so deployments choose the transport: [`InertMetricFactory`] drops every
//! observation (and must always be accepted), [`TracingMetricFactory`]
//! emits each one as a structured `tracing` event that a metrics pipeline
//! can consume downstream.
//!
//! All sequencer instruments carry a single label: the decimal tree ID.

use std::sync::Arc;

use tracing::trace;

/// Event target used by [`TracingMetricFactory`] instruments.
pub const METRICS_EVENT_TARGET: &str = "treeline_metrics";

/// Monotonically increasing counter.
pub trait Counter: Send + Sync {
    /// Adds `value` to the counter for `label`.
    fn add(&self, value: f64, label: &str);

    /// Increments the counter for `label` by one.
    fn inc(&self, label: &str) {
        self.add(1.0, label);
    }
}

/// Instantaneous value.
pub trait Gauge: Send + Sync {
    /// Sets the gauge for `label`.
    fn set(&self, value: f64, label: &str);
}

/// Distribution of observed values.
pub trait Histogram: Send + Sync {
    /// Records one observation for `label`.
    fn observe(&self, value: f64, label: &str);
}

/// Produces labeled instruments.
///
/// Factories are consulted once per instrument at process start; the
/// returned trait objects are shared for the process lifetime.
pub trait MetricFactory: Send + Sync {
    /// Creates a counter.
    fn new_counter(
        &self,
        name: &'static str,
        help: &'static str,
        label: &'static str,
    ) -> Arc<dyn Counter>;

    /// Creates a gauge.
    fn new_gauge(
        &self,
        name: &'static str,
        help: &'static str,
        label: &'static str,
    ) -> Arc<dyn Gauge>;

    /// Creates a histogram.
    fn new_histogram(
        &self,
        name: &'static str,
        help: &'static str,
        label: &'static str,
    ) -> Arc<dyn Histogram>;
}

/// Factory whose instruments discard every observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct InertMetricFactory;

struct InertInstrument;

impl Counter for InertInstrument {
    fn add(&self, _value: f64, _label: &str) {}
}

impl Gauge for InertInstrument {
    fn set(&self, _value: f64, _label: &str) {}
}

impl Histogram for InertInstrument {
    fn observe(&self, _value: f64, _label: &str) {}
}

impl MetricFactory for InertMetricFactory {
    fn new_counter(
        &self,
        _name: &'static str,
        _help: &'static str,
        _label: &'static str,
    ) -> Arc<dyn Counter> {
        Arc::new(InertInstrument)
    }

    fn new_gauge(
        &self,
        _name: &'static str,
        _help: &'static str,
        _label: &'static str,
    ) -> Arc<dyn Gauge> {
        Arc::new(InertInstrument)
    }

    fn new_histogram(
        &self,
        _name: &'static str,
        _help: &'static str,
        _label: &'static str,
    ) -> Arc<dyn Histogram> {
        Arc::new(InertInstrument)
    }
}

/// Factory whose instruments emit structured tracing events.
///
/// Registry wiring (Prometheus or otherwise) can subscribe to the
/// [`METRICS_EVENT_TARGET`] target and aggregate the samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetricFactory;

struct TracingInstrument {
    name: &'static str,
    label: &'static str,
}

impl Counter for TracingInstrument {
    fn add(&self, value: f64, label: &str) {
        trace!(
            target: "treeline_metrics",
            metric = self.name,
            kind = "counter",
            label_key = self.label,
            label,
            value,
            "metric sample"
        );
    }
}

impl Gauge for TracingInstrument {
    fn set(&self, value: f64, label: &str) {
        trace!(
            target: "treeline_metrics",
            metric = self.name,
            kind = "gauge",
            label_key = self.label,
            label,
            value,
            "metric sample"
        );
    }
}

impl Histogram for TracingInstrument {
    fn observe(&self, value: f64, label: &str) {
        trace!(
            target: "treeline_metrics",
            metric = self.name,
            kind = "histogram",
            label_key = self.label,
            label,
            value,
            "metric sample"
        );
    }
}

impl MetricFactory for TracingMetricFactory {
    fn new_counter(
        &self,
        name: &'static str,
        _help: &'static str,
        label: &'static str,
    ) -> Arc<dyn Counter> {
        Arc::new(TracingInstrument { name, label })
    }

    fn new_gauge(
        &self,
        name: &'static str,
        _help: &'static str,
        label: &'static str,
    ) -> Arc<dyn Gauge> {
        Arc::new(TracingInstrument { name, label })
    }

    fn new_histogram(
        &self,
        name: &'static str,
        _help: &'static str,
        label: &'static str,
    ) -> Arc<dyn Histogram> {
        Arc::new(TracingInstrument { name, label })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inert_factory_produces_usable_instruments() {
        let factory = InertMetricFactory;
        let counter = factory.new_counter("c", "help", "log_id");
        let gauge = factory.new_gauge("g", "help", "log_id");
        let histogram = factory.new_histogram("h", "help", "log_id");

        counter.inc("1");
        counter.add(41.0, "1");
        gauge.set(7.0, "1");
        histogram.observe(0.25, "1");
    }

    #[test]
    fn tracing_factory_produces_usable_instruments() {
        let factory = TracingMetricFactory;
        factory.new_counter("c", "help", "log_id").inc("9");
        factory.new_gauge("g", "help", "log_id").set(1.0, "9");
        factory
            .new_histogram("h", "help", "log_id")
            .observe(2.0, "9");
    }
}
