//! Prometheus export of bus metrics.
//!
//! Names follow `<namespace>_<metric>_<unit>`. Bus counters are exported as
//! counters; each [`observe`](BusMetricsExporter::observe) advances them by
//! the growth since the previous snapshot. Latency, throughput, uptime and
//! circuit state are gauges.

use crate::TelemetryError;
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use resilient_bus::{CircuitState, MetricsSnapshot};

/// Owns a registry holding one collector per bus metric.
pub struct BusMetricsExporter {
    registry: Registry,
    published: IntCounter,
    processed: IntCounter,
    failed: IntCounter,
    dropped: IntCounter,
    rejected: IntCounter,
    retries: IntCounter,
    dead_lettered: IntCounter,
    avg_latency: Gauge,
    throughput: Gauge,
    uptime: Gauge,
    /// 0 = closed, 1 = half-open, 2 = open
    circuit_state: IntGauge,
}

impl BusMetricsExporter {
    /// Create and register all collectors under `namespace`.
    pub fn new(namespace: &str) -> Result<Self, TelemetryError> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, TelemetryError> {
            let counter = IntCounter::with_opts(Opts::new(name, help).namespace(namespace))
                .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
            Ok(counter)
        };
        let int_gauge = |name: &str, help: &str| -> Result<IntGauge, TelemetryError> {
            let gauge = IntGauge::with_opts(Opts::new(name, help).namespace(namespace))
                .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
            Ok(gauge)
        };
        let gauge = |name: &str, help: &str| -> Result<Gauge, TelemetryError> {
            let gauge = Gauge::with_opts(Opts::new(name, help).namespace(namespace))
                .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
            Ok(gauge)
        };

        let published = counter("events_published_total", "Events accepted for dispatch")?;
        let processed = counter("events_processed_total", "Successful handler invocations")?;
        let failed = counter("events_failed_total", "Subscriptions failed after retries")?;
        let dropped = counter("events_dropped_total", "Events dropped by a filter")?;
        let rejected = counter("events_rejected_total", "Publishes refused before dispatch")?;
        let retries = counter("retries_total", "Retry attempts scheduled")?;
        let dead_lettered =
            counter("dead_lettered_total", "Events pushed to the dead letter queue")?;
        let avg_latency =
            gauge("handler_latency_avg_seconds", "Mean successful handler latency")?;
        let throughput = gauge("throughput_events_per_second", "Published events per second")?;
        let uptime = gauge("uptime_seconds", "Seconds since the bus was created")?;
        let circuit_state = int_gauge(
            "circuit_state",
            "Circuit breaker state (0 closed, 1 half-open, 2 open)",
        )?;

        let exporter = Self {
            registry,
            published,
            processed,
            failed,
            dropped,
            rejected,
            retries,
            dead_lettered,
            avg_latency,
            throughput,
            uptime,
            circuit_state,
        };
        Ok(exporter)
    }

    /// Bring the collectors up to `snapshot`.
    ///
    /// Counters never move backwards, so a snapshot older than the last one
    /// observed leaves them unchanged.
    pub fn observe(&self, snapshot: &MetricsSnapshot) {
        advance(&self.published, snapshot.published);
        advance(&self.processed, snapshot.processed);
        advance(&self.failed, snapshot.failed);
        advance(&self.dropped, snapshot.dropped);
        advance(&self.rejected, snapshot.rejected);
        advance(&self.retries, snapshot.retries);
        advance(&self.dead_lettered, snapshot.dead_lettered);
        self.avg_latency.set(snapshot.avg_latency.as_secs_f64());
        self.throughput.set(snapshot.throughput);
        self.uptime.set(snapshot.uptime.as_secs_f64());
    }

    pub fn observe_circuit(&self, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        };
        self.circuit_state.set(value);
    }

    /// Registry for callers that serve it alongside other collectors.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode all collectors in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, TelemetryError> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
    }
}

fn advance(counter: &IntCounter, total: u64) {
    let delta = total.saturating_sub(counter.get());
    if delta > 0 {
        counter.inc_by(delta);
    }
}
