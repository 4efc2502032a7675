//! `POST /v1/messages` pipeline and the auxiliary endpoints (spec §4.3).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{FromRef, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::cache::{fingerprint, ResponseCache, TieredCache};
use crate::canonical::CanonicalRequest;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::ConfigManager;
use crate::credentials::CredentialStore;
use crate::error::AppError;
use crate::http_client::{send_buffered, send_streaming, DynamicBackoff};
use crate::latency::{AttemptTimer, EwmaTracker};
use crate::router::{self, CustomRouter};
use crate::transformer::TransformerRegistry;

/// Shared state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    pub config_manager: Arc<ConfigManager>,
    pub credential_store: Arc<CredentialStore>,
    pub transformers: Arc<TransformerRegistry>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub latency: Arc<EwmaTracker>,
    pub response_cache: Arc<ResponseCache>,
    pub tiered_cache: Arc<TieredCache>,
    pub custom_router: Option<Arc<dyn CustomRouter>>,
    /// `None` when `server.maxConcurrentStreams == 0` (unbounded).
    pub stream_semaphore: Option<Arc<Semaphore>>,
}

impl FromRef<AppState> for Arc<EwmaTracker> {
    fn from_ref(state: &AppState) -> Self {
        state.latency.clone()
    }
}

/// Resolves which registered `Transformer` handles a provider: an explicit
/// `metadata.transformer` override, falling back to the provider id itself
/// (spec §4.7's `transformers[]` table keys adapters by provider id unless
/// overridden).
fn transformer_name_for(provider: &crate::config::Provider) -> &str {
    provider.metadata_str("transformer").unwrap_or(provider.id.as_str())
}

fn provider_transformer_enabled(config: &crate::config::Config, provider_id: &str) -> bool {
    config
        .file()
        .transformers
        .iter()
        .find(|t| t.provider == provider_id)
        .map(|t| t.enabled)
        .unwrap_or(true)
}

pub async fn handle_messages(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, AppError> {
    let request_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("handle_messages", request_id = %request_id);
    let _guard = span.enter();

    // Step 1: validate.
    let mut request: CanonicalRequest =
        serde_json::from_slice(&body).map_err(|e| AppError::RequestInvalid(e.to_string()))?;
    request.validate()?;

    // Step 2: inbound Authorization is never read, never forwarded — this
    // handler never extracts the client's Authorization header at all, so
    // there is nothing to strip. Upstream auth is synthesized per-provider
    // inside each Transformer from the provider's own configured secret.
    let streaming = request.stream;
    crate::metrics::record_request(streaming);

    let config = state.config_manager.current();
    let cache_key = fingerprint(&request);

    // Step 3: cache probe for non-streaming requests.
    if !streaming {
        if let Some(cached) = state.response_cache.get(&cache_key) {
            crate::metrics::record_cache_hit();
            return Ok(Json(cached).into_response());
        }
        crate::metrics::record_cache_miss();
    }

    // Step 4: route, resolve adapter, translate request.
    let route_result = router::route(&request, &config, state.custom_router.as_deref())?;
    state.circuit_breaker.allow(&route_result.provider_id)?;

    let provider = config
        .provider(&route_result.provider_id)
        .ok_or_else(|| AppError::NoProviderAvailable)?;

    if !provider_transformer_enabled(&config, &provider.id) {
        return Err(AppError::TransformerFailure {
            adapter: provider.id.clone(),
            message: "transformer disabled for this provider".into(),
        });
    }

    let transformer_name = transformer_name_for(provider);
    let transformer = state.transformers.get(transformer_name).ok_or_else(|| {
        AppError::TransformerFailure {
            adapter: transformer_name.to_string(),
            message: "no registered transformer for this adapter".into(),
        }
    })?;

    let mut routed_request = request.clone();
    routed_request.model = route_result.model.clone();

    let parts = transformer.request(&routed_request, provider)?;
    let backoff = DynamicBackoff::new(state.latency.clone());

    // Step 5: streaming path.
    if streaming && transformer.supports_streaming() {
        let _permit = match &state.stream_semaphore {
            Some(sem) => Some(sem.clone().acquire_owned().await.map_err(|_| {
                AppError::TransformerFailure {
                    adapter: transformer_name.to_string(),
                    message: "stream semaphore closed".into(),
                }
            })?),
            None => None,
        };

        let timer = AttemptTimer::start(&state.latency, &route_result.provider_id);
        let mut builder = config.http_client().post(&parts.url).json(&parts.body);
        for (name, value) in &parts.headers {
            builder = builder.header(name, value);
        }

        let upstream = match send_streaming(builder).await {
            Ok(resp) => resp,
            Err(err) => {
                timer.finish_failure();
                state.circuit_breaker.record_error(&route_result.provider_id);
                return Err(err);
            }
        };
        timer.finish_success();
        state.circuit_breaker.record_success(&route_result.provider_id);

        // _permit is moved into the response so it's held for the lifetime
        // of the streamed body, not just this handler's synchronous part.
        let response = crate::sse::stream_response(upstream, transformer);
        return Ok(hold_permit(response, _permit));
    }

    // Step 6: buffered request/response.
    let provider_id = route_result.provider_id.clone();
    let retries = provider.retry_count.unwrap_or(2);
    let raw_body = router_attempt(
        &provider_id,
        retries,
        &backoff,
        &state.circuit_breaker,
        &state.latency,
        || {
            let mut builder = config.http_client().post(&parts.url).json(&parts.body);
            for (name, value) in &parts.headers {
                builder = builder.header(name, value);
            }
            send_buffered(builder)
        },
    )
    .await?;

    let canonical_response = transformer.response(&raw_body, &routed_request)?;

    if !streaming {
        state.response_cache.put(cache_key, canonical_response.clone());
    }

    Ok(Json(canonical_response).into_response())
}

/// Wraps a buffered upstream attempt with retry/backoff and circuit-breaker
/// bookkeeping, shared between the (currently single) buffered call site.
async fn router_attempt<F, Fut>(
    provider: &str,
    max_retries: usize,
    backoff: &DynamicBackoff,
    circuit_breaker: &CircuitBreaker,
    latency: &EwmaTracker,
    mut attempt: F,
) -> Result<serde_json::Value, AppError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<serde_json::Value, AppError>>,
{
    crate::http_client::retry_with_backoff(provider, max_retries, backoff, || {
        let timer = AttemptTimer::start(latency, provider);
        let fut = attempt();
        async move {
            match fut.await {
                Ok(value) => {
                    timer.finish_success();
                    circuit_breaker.record_success(provider);
                    Ok(value)
                }
                Err(err) => {
                    timer.finish_failure();
                    circuit_breaker.record_error(provider);
                    Err(err)
                }
            }
        }
    })
    .await
}

/// Axum drops response extensions once the handler returns but keeps the
/// body alive as long as it's polled; stashing the permit as an extension
/// on the response keeps it held until the streamed body itself is dropped.
fn hold_permit(mut response: Response, permit: Option<tokio::sync::OwnedSemaphorePermit>) -> Response {
    if let Some(permit) = permit {
        response
            .extensions_mut()
            .insert(PermitGuard(std::sync::Arc::new(permit)));
    }
    response
}

#[derive(Clone)]
struct PermitGuard(#[allow(dead_code)] std::sync::Arc<tokio::sync::OwnedSemaphorePermit>);

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config_manager.current();
    Json(json!({
        "status": "ok",
        "uptimeSeconds": crate::metrics::snapshot(state.latency.overall_avg_latency_ms()).uptime_seconds,
        "providers": config.providers().len(),
    }))
}

pub async fn providers_handler(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config_manager.current();
    let providers: Vec<_> = config
        .providers()
        .iter()
        .map(|p| {
            json!({
                "id": p.id,
                "name": p.name,
                "enabled": p.enabled,
                "priority": p.priority,
                "models": p.models,
                "defaultModel": p.default_model,
            })
        })
        .collect();
    Json(json!({ "providers": providers }))
}

pub async fn config_handler(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config_manager.current();
    let file = config.file();
    Json(json!({
        "version": file.version,
        "server": file.server,
        "logging": file.logging,
        "router": file.router,
        "features": file.features,
        "providerCount": file.providers.len(),
    }))
}

pub async fn cache_flush_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.response_cache.flush();
    state.tiered_cache.drop_l2();
    StatusCode::NO_CONTENT
}

pub async fn cache_stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.response_cache.stats())
}

/// Reads `VmRSS` from `/proc/self/status` (Linux-only; returns `None`
/// elsewhere or if the file can't be parsed).
fn current_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/// `GET /debug/metrics`: union of the `/metrics` JSON, process RSS and
/// cache stats (ADDED-6).
pub async fn debug_metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = crate::metrics::snapshot(state.latency.overall_avg_latency_ms());
    Json(json!({
        "metrics": snapshot,
        "rssBytes": current_rss_bytes(),
        "cache": state.response_cache.stats(),
    }))
}

/// `server.maxConcurrentStreams == 0` means unbounded (spec ADDED-6).
pub fn build_stream_semaphore(max_concurrent_streams: usize) -> Option<Arc<Semaphore>> {
    if max_concurrent_streams == 0 {
        None
    } else {
        Some(Arc::new(Semaphore::new(max_concurrent_streams)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_max_streams_is_unbounded() {
        assert!(build_stream_semaphore(0).is_none());
    }

    #[test]
    fn nonzero_max_streams_builds_a_bounded_semaphore() {
        let sem = build_stream_semaphore(4).unwrap();
        assert_eq!(sem.available_permits(), 4);
    }
}
