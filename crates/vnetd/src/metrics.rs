//! Prometheus metrics for vnetd
//!
//! Served as text by the control endpoint at `/metrics`.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Prometheus metrics collector for vnetd
#[derive(Clone)]
pub struct MetricsCollector {
    // Counters
    poll_ticks: CounterVec,
    records_published: CounterVec,
    sink_errors: CounterVec,
    settings_applied: Counter,
    settings_failed: Counter,

    // Gauges
    publish_queue_depth: Gauge,

    // Histograms
    poll_duration_seconds: Histogram,

    registry: Arc<Registry>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let poll_ticks = CounterVec::new(
            Opts::new("vnetd_poll_ticks_total", "Poll ticks run, by poller"),
            &["poller"],
        )?;
        registry.register(Box::new(poll_ticks.clone()))?;

        let records_published = CounterVec::new(
            Opts::new(
                "vnetd_records_published_total",
                "Records written to a sink, by queue",
            ),
            &["queue"],
        )?;
        registry.register(Box::new(records_published.clone()))?;

        let sink_errors = CounterVec::new(
            Opts::new("vnetd_sink_errors_total", "Failed sink writes, by queue"),
            &["queue"],
        )?;
        registry.register(Box::new(sink_errors.clone()))?;

        let settings_applied =
            Counter::new("vnetd_settings_applied_total", "Settings applied successfully")?;
        registry.register(Box::new(settings_applied.clone()))?;

        let settings_failed = Counter::new("vnetd_settings_failed_total", "Settings rejected")?;
        registry.register(Box::new(settings_failed.clone()))?;

        let publish_queue_depth = Gauge::new(
            "vnetd_publish_queue_depth",
            "Records waiting in the publish queue at the last slow poll",
        )?;
        registry.register(Box::new(publish_queue_depth.clone()))?;

        let poll_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("vnetd_poll_duration_seconds", "Slow poll tick duration in seconds")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(poll_duration_seconds.clone()))?;

        Ok(Self {
            poll_ticks,
            records_published,
            sink_errors,
            settings_applied,
            settings_failed,
            publish_queue_depth,
            poll_duration_seconds,
            registry: Arc::new(registry),
        })
    }

    pub fn record_poll_tick(&self, poller: &str) {
        self.poll_ticks.with_label_values(&[poller]).inc();
    }

    pub fn record_published(&self, queue: &str) {
        self.records_published.with_label_values(&[queue]).inc();
    }

    pub fn record_sink_error(&self, queue: &str) {
        self.sink_errors.with_label_values(&[queue]).inc();
    }

    /// Record the outcome of one `apply`
    pub fn record_setting(&self, ok: bool) {
        if ok {
            self.settings_applied.inc();
        } else {
            self.settings_failed.inc();
        }
    }

    pub fn set_publish_queue_depth(&self, depth: usize) {
        self.publish_queue_depth.set(depth as f64);
    }

    /// Start slow poll duration timer
    pub fn start_poll_timer(&self) -> prometheus::HistogramTimer {
        self.poll_duration_seconds.start_timer()
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = vec![];
        encoder.encode(&self.registry.gather(), &mut buf).ok();
        String::from_utf8(buf).unwrap_or_else(|_| String::from("# Error encoding metrics\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_creation() {
        assert!(MetricsCollector::new().is_ok());
    }

    #[test]
    fn test_record_poll_tick() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_poll_tick("slow");
        collector.record_poll_tick("slow");
        let metrics = collector.gather_metrics();
        assert!(metrics.contains("vnetd_poll_ticks_total{poller=\"slow\"} 2"));
    }

    #[test]
    fn test_record_setting() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_setting(true);
        collector.record_setting(false);
        collector.record_setting(false);
        let metrics = collector.gather_metrics();
        assert!(metrics.contains("vnetd_settings_applied_total 1"));
        assert!(metrics.contains("vnetd_settings_failed_total 2"));
    }

    #[test]
    fn test_set_publish_queue_depth() {
        let collector = MetricsCollector::new().unwrap();
        collector.set_publish_queue_depth(42);
        assert!(collector
            .gather_metrics()
            .contains("vnetd_publish_queue_depth 42"));
    }

    #[test]
    fn test_sink_errors_by_queue() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_sink_error("hf");
        let metrics = collector.gather_metrics();
        assert!(metrics.contains("vnetd_sink_errors_total{queue=\"hf\"} 1"));
    }
}
