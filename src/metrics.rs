//! Prometheus metrics for the LightRAG server.
//!
//! Exposes:
//! - `lightrag_http_request_duration_seconds` (histogram)
//! - `lightrag_http_requests_total` (counter with status)
//! - `lightrag_http_requests_inflight` (gauge)
//! - `lightrag_documents_processed_total` (counter by result)
//! - `lightrag_llm_calls_total` (counter by kind and cache hit)
//! - process metrics via `process` collector

use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::process_collector::ProcessCollector;
use prometheus::{
    default_registry, register_histogram_vec, register_int_counter_vec, register_int_gauge_vec,
    Encoder, HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};
use tracing::{error, warn};

static PROCESS_COLLECTOR: Lazy<()> = Lazy::new(|| {
    if let Err(err) = default_registry().register(Box::new(ProcessCollector::for_self())) {
        warn!("Failed to register process collector: {}", err);
    }
});

static REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    // Exponential buckets from 5ms up to ~40 seconds.
    let buckets =
        prometheus::exponential_buckets(0.005, 2.0, 14).expect("failed to create histogram buckets");
    register_histogram_vec!(
        "lightrag_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "route"],
        buckets
    )
    .expect("failed to register request duration histogram")
});

static REQUEST_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lightrag_http_requests_total",
        "Total HTTP requests by status",
        &["method", "route", "status"]
    )
    .expect("failed to register request counter")
});

static REQUEST_INFLIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "lightrag_http_requests_inflight",
        "Number of in-flight HTTP requests",
        &["route"]
    )
    .expect("failed to register inflight gauge")
});

static DOCUMENTS_PROCESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lightrag_documents_processed_total",
        "Documents finished by the indexing pipeline",
        &["result"]
    )
    .expect("failed to register document counter")
});

static LLM_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "lightrag_llm_calls_total",
        "LLM invocations by purpose and cache hit",
        &["kind", "cached"]
    )
    .expect("failed to register llm call counter")
});

/// Ensure collectors are registered.
pub fn init_collectors() {
    Lazy::force(&PROCESS_COLLECTOR);
    Lazy::force(&REQUEST_DURATION);
    Lazy::force(&REQUEST_TOTAL);
    Lazy::force(&REQUEST_INFLIGHT);
    Lazy::force(&DOCUMENTS_PROCESSED);
    Lazy::force(&LLM_CALLS);
}

/// Increment inflight gauge for a route.
pub fn record_request_start(route: &str) {
    init_collectors();
    REQUEST_INFLIGHT.with_label_values(&[route]).inc();
}

/// Record request completion with duration and response status.
pub fn record_request_result(method: &str, route: &str, duration: Duration, status: u16) {
    init_collectors();
    REQUEST_INFLIGHT.with_label_values(&[route]).dec();
    REQUEST_DURATION
        .with_label_values(&[method, route])
        .observe(duration.as_secs_f64());
    REQUEST_TOTAL
        .with_label_values(&[method, route, &status.to_string()])
        .inc();
}

pub fn record_document_result(success: bool) {
    init_collectors();
    DOCUMENTS_PROCESSED
        .with_label_values(&[if success { "processed" } else { "failed" }])
        .inc();
}

pub fn record_llm_call(kind: &str, cached: bool) {
    init_collectors();
    LLM_CALLS
        .with_label_values(&[kind, if cached { "true" } else { "false" }])
        .inc();
}

/// Encode every registered metric; returns the body and its content type.
pub fn render() -> (Vec<u8>, String) {
    init_collectors();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", err);
        buffer.clear();
    }
    (buffer, encoder.format_type().to_string())
}

/// Resident memory and accumulated CPU time of this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessSnapshot {
    pub resident_memory_bytes: f64,
    pub cpu_seconds_total: f64,
}

/// Read the process collector; `None` where it has no data (non-Linux).
pub fn process_snapshot() -> Option<ProcessSnapshot> {
    use prometheus::core::Collector;

    if !cfg!(target_os = "linux") {
        return None;
    }
    let collector = ProcessCollector::for_self();
    let mut snapshot = ProcessSnapshot::default();
    let mut seen = false;
    for family in collector.collect() {
        let Some(metric) = family.get_metric().first() else {
            continue;
        };
        match family.get_name() {
            "process_resident_memory_bytes" => {
                snapshot.resident_memory_bytes = metric.get_gauge().get_value();
                seen = true;
            }
            "process_cpu_seconds_total" => {
                snapshot.cpu_seconds_total = metric.get_counter().get_value();
                seen = true;
            }
            _ => {}
        }
    }
    seen.then_some(snapshot)
}
