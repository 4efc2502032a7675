//! Request/performance/cache counters, exported as Prometheus text and as
//! JSON (spec §6).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use lazy_static::lazy_static;
use prometheus::{
    core::Collector, register_counter, register_counter_vec, Counter, CounterVec, Encoder,
    TextEncoder,
};
use serde::Serialize;

lazy_static! {
    static ref REQUESTS_TOTAL: Counter =
        register_counter!("ucr_requests_total", "Total number of requests handled").unwrap();
    static ref REQUESTS_STREAMING: Counter =
        register_counter!("ucr_requests_streaming_total", "Total number of streaming requests").unwrap();
    static ref REQUESTS_NON_STREAMING: Counter =
        register_counter!("ucr_requests_non_streaming_total", "Total number of non-streaming requests").unwrap();
    static ref REQUESTS_ERRORS: CounterVec = register_counter_vec!(
        "ucr_requests_errors_total",
        "Total number of failed requests by error kind",
        &["kind"]
    )
    .unwrap();
    static ref CACHE_HITS: Counter =
        register_counter!("ucr_cache_hits_total", "Response cache hits").unwrap();
    static ref CACHE_MISSES: Counter =
        register_counter!("ucr_cache_misses_total", "Response cache misses").unwrap();
}

static STARTUP: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
static REQUEST_COUNT_FOR_RPS: AtomicU64 = AtomicU64::new(0);

/// Must be called once at process startup so `uptimeSeconds` is accurate.
pub fn init() {
    STARTUP.get_or_init(Instant::now);
}

fn uptime_seconds() -> u64 {
    STARTUP.get_or_init(Instant::now).elapsed().as_secs()
}

pub fn record_request(streaming: bool) {
    REQUESTS_TOTAL.inc();
    REQUEST_COUNT_FOR_RPS.fetch_add(1, Ordering::Relaxed);
    if streaming {
        REQUESTS_STREAMING.inc();
    } else {
        REQUESTS_NON_STREAMING.inc();
    }
}

pub fn record_error(kind: &str) {
    REQUESTS_ERRORS.with_label_values(&[kind]).inc();
}

pub fn record_cache_hit() {
    CACHE_HITS.inc();
}

pub fn record_cache_miss() {
    CACHE_MISSES.inc();
}

fn error_rate() -> f64 {
    let total = REQUESTS_TOTAL.get();
    if total <= 0.0 {
        return 0.0;
    }
    let errors: f64 = REQUESTS_ERRORS.collect().iter().flat_map(|m| m.get_metric()).map(|m| m.get_counter().get_value()).sum();
    errors / total
}

fn requests_per_second() -> f64 {
    let uptime = uptime_seconds().max(1);
    REQUEST_COUNT_FOR_RPS.load(Ordering::Relaxed) as f64 / uptime as f64
}

fn cache_hit_rate() -> f64 {
    let hits = CACHE_HITS.get();
    let misses = CACHE_MISSES.get();
    let total = hits + misses;
    if total <= 0.0 {
        0.0
    } else {
        hits / total
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestsJson {
    total: f64,
    streaming: f64,
    non_streaming: f64,
    errors: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PerformanceJson {
    avg_latency_ms: Option<f64>,
    requests_per_second: f64,
    error_rate: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CacheJson {
    hits: f64,
    misses: f64,
    hit_rate: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsJson {
    requests: RequestsJson,
    performance: PerformanceJson,
    cache: CacheJson,
    pub uptime_seconds: u64,
}

/// Builds the spec §6 JSON counters. `avg_latency_ms` is read from the
/// router's EWMA tracker (ADDED-4: a secondary signal, feeds this field
/// only — never provider selection).
pub fn snapshot(avg_latency_ms: Option<f64>) -> MetricsJson {
    let errors: f64 = REQUESTS_ERRORS
        .collect()
        .iter()
        .flat_map(|m| m.get_metric())
        .map(|m| m.get_counter().get_value())
        .sum();

    MetricsJson {
        requests: RequestsJson {
            total: REQUESTS_TOTAL.get(),
            streaming: REQUESTS_STREAMING.get(),
            non_streaming: REQUESTS_NON_STREAMING.get(),
            errors,
        },
        performance: PerformanceJson {
            avg_latency_ms,
            requests_per_second: requests_per_second(),
            error_rate: error_rate(),
        },
        cache: CacheJson {
            hits: CACHE_HITS.get(),
            misses: CACHE_MISSES.get(),
            hit_rate: cache_hit_rate(),
        },
        uptime_seconds: uptime_seconds(),
    }
}

/// Serves Prometheus text exposition by default; JSON when the client's
/// `Accept` header prefers `application/json` (spec ADDED-11).
pub async fn metrics_handler(
    headers: axum::http::HeaderMap,
    axum::extract::State(latency): axum::extract::State<std::sync::Arc<crate::latency::EwmaTracker>>,
) -> axum::response::Response {
    let wants_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("application/json"))
        .unwrap_or(false);

    if wants_json {
        return Json(snapshot(latency.overall_avg_latency_ms())).into_response();
    }

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response();
    }
    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

/// `GET /v1/usage`: JSON counters unconditionally (spec ADDED-11).
pub async fn usage_handler(
    axum::extract::State(latency): axum::extract::State<std::sync::Arc<crate::latency::EwmaTracker>>,
) -> axum::response::Response {
    Json(snapshot(latency.overall_avg_latency_ms())).into_response()
}
