use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

pub const READS_TOTAL: &str = "ab_reads_total";
pub const READ_ERRORS_TOTAL: &str = "ab_read_errors_total";
pub const READ_LATENCY_SECONDS: &str = "ab_read_latency_seconds";
const BACKEND_LABEL: &str = "db";

/// Receives the outcome of every point lookup.
///
/// Implementations are shared by all workers at once, so every method
/// must be cheap and safe to call concurrently. Each method takes the
/// identity of the backend that produced the sample, so one sink can
/// serve several backends in the same process.
pub trait MetricsSink: Send + Sync {
    fn read_succeeded(&self, backend: &str);
    fn read_failed(&self, backend: &str);
    fn observe_latency(&self, backend: &str, latency: Duration);
}

/// The three read instruments, registered in a Prometheus registry.
pub struct PrometheusMetrics {
    registry: Registry,
    reads: CounterVec,
    read_errors: CounterVec,
    read_latency: HistogramVec,
}

impl PrometheusMetrics {
    /// Creates the instruments in a fresh registry.
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Result<Self> {
        let reads = CounterVec::new(
            Opts::new(READS_TOTAL, "Total number of successful reads."),
            &[BACKEND_LABEL],
        )?;
        let read_errors = CounterVec::new(
            Opts::new(READ_ERRORS_TOTAL, "Total number of read errors."),
            &[BACKEND_LABEL],
        )?;
        let read_latency = HistogramVec::new(
            HistogramOpts::new(READ_LATENCY_SECONDS, "Read latency distribution.")
                .buckets(prometheus::DEFAULT_BUCKETS.to_vec()),
            &[BACKEND_LABEL],
        )?;

        registry.register(Box::new(reads.clone()))?;
        registry.register(Box::new(read_errors.clone()))?;
        registry.register(Box::new(read_latency.clone()))?;

        Ok(Self {
            registry,
            reads,
            read_errors,
            read_latency,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn reads(&self, backend: &str) -> u64 {
        self.reads.with_label_values(&[backend]).get() as u64
    }

    pub fn read_errors(&self, backend: &str) -> u64 {
        self.read_errors.with_label_values(&[backend]).get() as u64
    }

    pub fn latency_samples(&self, backend: &str) -> u64 {
        self.read_latency
            .with_label_values(&[backend])
            .get_sample_count()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn read_succeeded(&self, backend: &str) {
        self.reads.with_label_values(&[backend]).inc();
    }

    fn read_failed(&self, backend: &str) {
        self.read_errors.with_label_values(&[backend]).inc();
    }

    fn observe_latency(&self, backend: &str, latency: Duration) {
        self.read_latency
            .with_label_values(&[backend])
            .observe(latency.as_secs_f64());
    }
}

/// Forwards every sample to several sinks.
pub struct TeeSink(Vec<Arc<dyn MetricsSink>>);

impl TeeSink {
    pub fn new(sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        Self(sinks)
    }
}

impl MetricsSink for TeeSink {
    fn read_succeeded(&self, backend: &str) {
        self.0.iter().for_each(|s| s.read_succeeded(backend));
    }

    fn read_failed(&self, backend: &str) {
        self.0.iter().for_each(|s| s.read_failed(backend));
    }

    fn observe_latency(&self, backend: &str, latency: Duration) {
        self.0.iter().for_each(|s| s.observe_latency(backend, latency));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::RecordingSink;

    #[test]
    fn test_instruments_are_labeled_by_backend() {
        let m = PrometheusMetrics::new().unwrap();
        m.read_succeeded("postgres");
        m.read_succeeded("postgres");
        m.read_failed("postgres");
        m.read_succeeded("mongo");
        m.observe_latency("postgres", Duration::from_millis(3));

        assert_eq!(m.reads("postgres"), 2);
        assert_eq!(m.read_errors("postgres"), 1);
        assert_eq!(m.reads("mongo"), 1);
        assert_eq!(m.read_errors("mongo"), 0);
        assert_eq!(m.latency_samples("postgres"), 1);
        assert_eq!(m.latency_samples("mongo"), 0);
    }

    #[test]
    fn test_render_contains_all_instruments() {
        let m = PrometheusMetrics::new().unwrap();
        m.read_succeeded("etcd");
        m.read_failed("etcd");
        m.observe_latency("etcd", Duration::from_micros(700));

        let text = String::from_utf8(m.render().unwrap()).unwrap();
        assert!(text.contains(r#"ab_reads_total{db="etcd"} 1"#), "{}", text);
        assert!(text.contains(r#"ab_read_errors_total{db="etcd"} 1"#), "{}", text);
        assert!(text.contains(r#"ab_read_latency_seconds_count{db="etcd"} 1"#), "{}", text);
    }

    #[test]
    fn test_two_sinks_do_not_collide() {
        // Each sink owns its registry, so creating two is fine
        let a = PrometheusMetrics::new().unwrap();
        let b = PrometheusMetrics::new().unwrap();
        a.read_succeeded("mysql");
        assert_eq!(b.reads("mysql"), 0);
    }

    #[test]
    fn test_tee_forwards_to_every_sink() {
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        let tee = TeeSink::new(vec![first.clone(), second.clone()]);

        tee.read_succeeded("cassandra");
        tee.read_failed("cassandra");
        tee.observe_latency("cassandra", Duration::from_millis(1));

        for sink in [&first, &second] {
            let totals = sink.totals("cassandra");
            assert_eq!(totals.successes, 1);
            assert_eq!(totals.failures, 1);
            assert_eq!(totals.latency_samples, 1);
        }
    }
}
