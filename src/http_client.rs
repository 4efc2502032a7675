//! Pooled upstream HTTP client, buffered/streaming request helpers, and
//! EWMA-scaled exponential backoff for retries (spec §4.6).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, Response};
use tracing::{debug, trace};

use crate::error::AppError;
use crate::latency::EwmaTracker;

/// Dynamic backoff scaler that stretches/compresses retry delays based on
/// a provider's EWMA latency trend relative to a reference baseline.
#[derive(Debug, Clone)]
pub struct DynamicBackoff {
    reference_latency_ms: f64,
    min_scale: f64,
    max_scale: f64,
    ewma_tracker: Arc<EwmaTracker>,
}

impl DynamicBackoff {
    pub fn new(ewma_tracker: Arc<EwmaTracker>) -> Self {
        DynamicBackoff {
            reference_latency_ms: 1000.0,
            min_scale: 0.5,
            max_scale: 3.0,
            ewma_tracker,
        }
    }

    pub fn with_params(
        ewma_tracker: Arc<EwmaTracker>,
        reference_latency_ms: f64,
        min_scale: f64,
        max_scale: f64,
    ) -> Self {
        DynamicBackoff {
            reference_latency_ms: reference_latency_ms.max(1.0),
            min_scale: min_scale.clamp(0.1, 10.0),
            max_scale: max_scale.clamp(0.1, 10.0),
            ewma_tracker,
        }
    }

    /// `factor = clamp(ewma_ms / reference_ms, min_scale, max_scale)`, or
    /// `1.0` (no scaling) if the provider has no EWMA data yet.
    pub fn scale_factor(&self, provider: &str) -> f64 {
        match self.ewma_tracker.get_latency(provider) {
            Some((ewma_secs, _)) if ewma_secs > 0.0 => {
                let ewma_ms = ewma_secs * 1000.0;
                let factor = (ewma_ms / self.reference_latency_ms).clamp(self.min_scale, self.max_scale);
                trace!(provider, ewma_ms, factor, "dynamic backoff scale factor");
                factor
            }
            _ => 1.0,
        }
    }

    /// Exponential backoff (`base * 2^attempt`, capped at `max_ms`) scaled
    /// by the provider's current EWMA trend, never below `base_ms`.
    pub fn exponential_with_ewma(&self, provider: &str, base_ms: u64, attempt: usize, max_ms: u64) -> Duration {
        let exponential_ms = base_ms.saturating_mul(2_u64.saturating_pow(attempt as u32));
        let clamped_base = exponential_ms.min(max_ms);

        let factor = self.scale_factor(provider);
        let scaled_ms = (clamped_base as f64 * factor).max(1.0) as u64;
        let final_ms = scaled_ms.min(max_ms).max(base_ms);

        debug!(provider, attempt, base_ms, factor, final_ms, "EWMA-scaled exponential backoff");
        Duration::from_millis(final_ms)
    }
}

/// Builds the single pooled client shared by every provider (spec §4.6):
/// at least 100 idle connections kept warm, generous per-connection
/// in-flight allowance via HTTP/2, 60s idle keep-alive.
pub fn build_client(pool_max_idle_per_host: usize, default_timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(60))
        .tcp_keepalive(Duration::from_secs(60))
        .tcp_nodelay(true)
        .timeout(default_timeout)
        .build()
}

/// Sends a buffered (non-streaming) request and returns the parsed JSON
/// body, mapping upstream failures onto the error taxonomy (spec §7).
pub async fn send_buffered(
    request: reqwest::RequestBuilder,
) -> Result<serde_json::Value, AppError> {
    let response = request.send().await.map_err(classify_transport_error)?;
    read_buffered_body(response).await
}

async fn read_buffered_body(response: Response) -> Result<serde_json::Value, AppError> {
    let status = response.status();
    let body = response.text().await.map_err(|_| AppError::UpstreamInvalidBody)?;

    if !status.is_success() {
        return Err(AppError::upstream(status, &body));
    }

    serde_json::from_str(&body).map_err(|_| AppError::UpstreamInvalidBody)
}

/// Sends a streaming request and returns the raw byte stream for the SSE
/// layer to consume line-by-line (spec §4.6, §4.3).
pub async fn send_streaming(
    request: reqwest::RequestBuilder,
) -> Result<Response, AppError> {
    let response = request.send().await.map_err(classify_transport_error)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::upstream(status, &body));
    }
    Ok(response)
}

fn classify_transport_error(err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::UpstreamTimeout
    } else {
        AppError::upstream(
            err.status().unwrap_or(reqwest::StatusCode::BAD_GATEWAY),
            err.to_string(),
        )
    }
}

/// Retries `attempt` against an upstream up to `max_retries` times,
/// applying EWMA-scaled exponential backoff between attempts. Only retries
/// transient failures (network/timeout, 408, 429, 5xx); never retries
/// other 4xx (spec §4.6).
pub async fn retry_with_backoff<F, Fut, T>(
    provider: &str,
    max_retries: usize,
    backoff: &DynamicBackoff,
    mut attempt: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, AppError>>,
{
    const BASE_MS: u64 = 1000;
    const MAX_MS: u64 = 10_000;

    let mut last_err = None;
    for i in 0..=max_retries {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if is_retryable(&err) && i < max_retries => {
                let delay = backoff.exponential_with_ewma(provider, BASE_MS, i, MAX_MS);
                debug!(provider, attempt = i, delay_ms = delay.as_millis(), "retrying after upstream error");
                tokio::time::sleep(delay).await;
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.expect("loop always returns or records an error before exiting"))
}

fn is_retryable(err: &AppError) -> bool {
    match err {
        AppError::UpstreamTimeout => true,
        AppError::UpstreamError { status: 408, .. } => true,
        AppError::UpstreamError { status: 429, .. } => true,
        AppError::UpstreamError { status, .. } => *status >= 500,
        _ => false,
    }
}

#[allow(dead_code)]
pub type StreamChunk = Result<Bytes, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with(provider: &str, latency_secs: f64) -> Arc<EwmaTracker> {
        let tracker = Arc::new(EwmaTracker::new());
        tracker.record_success(provider, latency_secs);
        tracker
    }

    #[test]
    fn neutral_scaling_without_ewma_data() {
        let backoff = DynamicBackoff::new(Arc::new(EwmaTracker::new()));
        assert_eq!(backoff.scale_factor("anthropic"), 1.0);
    }

    #[test]
    fn fast_provider_scales_down_to_floor() {
        let backoff = DynamicBackoff::new(tracker_with("anthropic", 0.3));
        assert_eq!(backoff.scale_factor("anthropic"), 0.5);
    }

    #[test]
    fn slow_provider_scales_up_within_ceiling() {
        let backoff = DynamicBackoff::new(tracker_with("anthropic", 2.5));
        assert!((backoff.scale_factor("anthropic") - 2.5).abs() < 0.001);
    }

    #[test]
    fn very_slow_provider_is_clamped() {
        let backoff = DynamicBackoff::new(tracker_with("anthropic", 5.0));
        assert_eq!(backoff.scale_factor("anthropic"), 3.0);
    }

    #[test]
    fn exponential_with_ewma_scales_each_attempt() {
        let backoff = DynamicBackoff::new(tracker_with("anthropic", 2.0));
        assert_eq!(backoff.exponential_with_ewma("anthropic", 100, 0, 10_000), Duration::from_millis(200));
        assert_eq!(backoff.exponential_with_ewma("anthropic", 100, 1, 10_000), Duration::from_millis(400));
    }

    #[test]
    fn exponential_respects_max_cap() {
        let backoff = DynamicBackoff::new(tracker_with("anthropic", 3.0));
        assert_eq!(backoff.exponential_with_ewma("anthropic", 100, 2, 500), Duration::from_millis(500));
    }

    #[test]
    fn exponential_never_drops_below_base() {
        let backoff = DynamicBackoff::new(tracker_with("anthropic", 0.5));
        assert_eq!(backoff.exponential_with_ewma("anthropic", 100, 0, 10_000), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn retry_with_backoff_gives_up_after_max_retries() {
        let backoff = DynamicBackoff::new(Arc::new(EwmaTracker::new()));
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let result: Result<(), AppError> = retry_with_backoff("anthropic", 2, &backoff, || {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(AppError::UpstreamTimeout) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_with_backoff_does_not_retry_client_errors() {
        let backoff = DynamicBackoff::new(Arc::new(EwmaTracker::new()));
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let result: Result<(), AppError> = retry_with_backoff("anthropic", 3, &backoff, || {
            attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(AppError::upstream(reqwest::StatusCode::BAD_REQUEST, "bad")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_with_backoff_retries_429_and_408() {
        let backoff = DynamicBackoff::new(Arc::new(EwmaTracker::new()));
        for status in [reqwest::StatusCode::TOO_MANY_REQUESTS, reqwest::StatusCode::REQUEST_TIMEOUT] {
            let attempts = std::sync::atomic::AtomicUsize::new(0);
            let result: Result<(), AppError> = retry_with_backoff("anthropic", 1, &backoff, || {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move { Err(AppError::upstream(status, "rate limited")) }
            })
            .await;
            assert!(result.is_err());
            assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
        }
    }

    #[tokio::test]
    async fn retry_with_backoff_succeeds_after_transient_failure() {
        let backoff = DynamicBackoff::new(Arc::new(EwmaTracker::new()));
        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let result = retry_with_backoff("anthropic", 3, &backoff, || {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(AppError::UpstreamTimeout)
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }
}
