//! Metrics collection for ChatServe
//!
//! This module provides Prometheus metrics for observability.

use lazy_static::lazy_static;
use prometheus::{Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Metrics registry for ChatServe
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub inference: InferenceMetrics,
    pub server: ServerMetrics,
}

/// Inference-related metrics
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    /// Total number of chat requests that reached the model
    pub requests_total: IntCounter,

    /// Total number of successful requests
    pub requests_success: IntCounter,

    /// Total number of failed requests
    pub requests_failed: IntCounter,

    /// Request duration histogram, including admission wait
    pub request_duration: Histogram,

    /// Generation duration histogram
    pub generation_duration: Histogram,

    /// Prompt tokens processed
    pub prompt_tokens_total: IntCounter,

    /// Tokens generated total
    pub tokens_generated_total: IntCounter,

    /// Tokens per second
    pub tokens_per_second: Histogram,

    /// Current active requests
    pub active_requests: IntGauge,
}

/// Server lifecycle metrics
#[derive(Debug, Clone)]
pub struct ServerMetrics {
    /// Requests rejected by body validation
    pub requests_rejected: IntCounter,

    /// Time spent loading model artifacts at startup
    pub model_load_seconds: Gauge,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("counter registered once");
    metric
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("gauge registered once");
    metric
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let metric = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("valid histogram definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("histogram registered once");
    metric
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Inference metrics
        let inference = InferenceMetrics {
            requests_total: counter(
                &registry,
                "chat_requests_total",
                "Total number of chat requests",
            ),
            requests_success: counter(
                &registry,
                "chat_requests_success_total",
                "Total number of successful chat requests",
            ),
            requests_failed: counter(
                &registry,
                "chat_requests_failed_total",
                "Total number of failed chat requests",
            ),
            request_duration: histogram(
                &registry,
                "chat_request_duration_seconds",
                "Chat request duration in seconds",
                vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0],
            ),
            generation_duration: histogram(
                &registry,
                "chat_generation_duration_seconds",
                "Model generation duration in seconds",
                vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0],
            ),
            prompt_tokens_total: counter(
                &registry,
                "chat_prompt_tokens_total",
                "Total number of prompt tokens processed",
            ),
            tokens_generated_total: counter(
                &registry,
                "chat_tokens_generated_total",
                "Total number of tokens generated",
            ),
            tokens_per_second: histogram(
                &registry,
                "chat_tokens_per_second",
                "Tokens generated per second",
                vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0],
            ),
            active_requests: int_gauge(
                &registry,
                "chat_active_requests",
                "Current number of active chat requests",
            ),
        };

        // Server metrics
        let requests_rejected = counter(
            &registry,
            "chat_requests_rejected_total",
            "Total number of chat requests rejected by validation",
        );

        let model_load_seconds = Gauge::new(
            "model_load_duration_seconds",
            "Time spent loading model artifacts at startup",
        )
        .expect("valid gauge definition");
        registry
            .register(Box::new(model_load_seconds.clone()))
            .expect("gauge registered once");

        MetricsRegistry {
            registry,
            inference,
            server: ServerMetrics {
                requests_rejected,
                model_load_seconds,
            },
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure, returning its result and the elapsed time
    fn observe_duration<F, R>(&self, f: F) -> (R, Duration)
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn observe_duration<F, R>(&self, f: F) -> (R, Duration)
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();
        self.observe(elapsed.as_secs_f64());
        (result, elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        metrics.inference.requests_total.inc();
        metrics.inference.active_requests.inc();
        metrics.server.requests_rejected.inc();

        let output = metrics.gather();
        assert!(output.contains("chat_requests_total"));
        assert!(output.contains("chat_active_requests"));
        assert!(output.contains("chat_requests_rejected_total"));
    }

    #[test]
    fn test_latency_timer() {
        let metrics = MetricsRegistry::new();

        let (value, elapsed) = metrics.inference.generation_duration.observe_duration(|| 42);

        assert_eq!(value, 42);
        assert!(elapsed < Duration::from_secs(1));
        assert_eq!(metrics.inference.generation_duration.get_sample_count(), 1);
    }
}
