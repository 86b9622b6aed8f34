//! Metrics registry and the periodic gauge exporter
//!
//! The agent owns its own Prometheus [`Registry`] instead of the global
//! default one. The allocated-bytes gauge is handed to [`MetricsExporter`]
//! through the [`GaugeSink`] trait so the exporter can be driven against a
//! test double.

use crate::core::Result;
use crate::system::stats;
use parking_lot::Mutex;
use prometheus::{Encoder, Gauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Name of the allocated heap bytes gauge
pub const MEMORY_ALLOC_GAUGE: &str = "heapwatch_memory_alloc_bytes";

/// Period of the gauge exporter
pub const EXPORT_PERIOD: Duration = Duration::from_secs(10);

/// A write-only scalar sink
///
/// Implementations must be internally synchronized and must not block.
pub trait GaugeSink: Send + Sync + 'static {
    /// Replace the current value
    fn record(&self, value: f64);
}

impl GaugeSink for Gauge {
    fn record(&self, value: f64) {
        self.set(value);
    }
}

impl<G: GaugeSink + ?Sized> GaugeSink for Arc<G> {
    fn record(&self, value: f64) {
        (**self).record(value);
    }
}

/// Gauge keeping every recorded value, for embedders that poll in-process
#[derive(Debug, Default)]
pub struct RecordingGauge {
    values: Mutex<Vec<f64>>,
}

impl RecordingGauge {
    /// Create an empty recording gauge
    pub fn new() -> Self {
        Self::default()
    }

    /// Values recorded so far, oldest first
    pub fn values(&self) -> Vec<f64> {
        self.values.lock().clone()
    }

    /// Most recent value
    pub fn last(&self) -> Option<f64> {
        self.values.lock().last().copied()
    }
}

impl GaugeSink for RecordingGauge {
    fn record(&self, value: f64) {
        self.values.lock().push(value);
    }
}

/// The agent's metrics: one registry and the gauges registered in it
#[derive(Clone)]
pub struct AgentMetrics {
    registry: Registry,
    /// Bytes of allocated heap objects
    pub memory_alloc: Gauge,
}

impl AgentMetrics {
    /// Create a registry with the agent gauges and the process collector
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let memory_alloc = Gauge::with_opts(Opts::new(
            MEMORY_ALLOC_GAUGE,
            "Bytes of allocated heap objects.",
        ))?;
        registry.register(Box::new(memory_alloc.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self { registry, memory_alloc })
    }

    /// The registry served on `/metrics`
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Collect and return all metrics of `registry` in the Prometheus text format
pub fn collect_metrics(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Pushes the allocated-bytes counter into a gauge on a fixed period
pub struct MetricsExporter<G: GaugeSink> {
    gauge: G,
    period: Duration,
}

impl<G: GaugeSink> MetricsExporter<G> {
    /// Exporter writing into `gauge` every [`EXPORT_PERIOD`]
    pub fn new(gauge: G) -> Self {
        Self { gauge, period: EXPORT_PERIOD }
    }

    /// Override the export period
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Export until `shutdown` is cancelled; returns the number of exports
    ///
    /// The first export happens immediately.
    pub async fn run(self, shutdown: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period = ?self.period, "metrics exporter started");

        let mut exports = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let snapshot = stats::capture();
            self.gauge.record(snapshot.alloc as f64);
            exports += 1;
            debug!(alloc = snapshot.alloc, "exported allocated bytes");
        }

        info!(exports, "metrics exporter stopped");
        exports
    }
}
