//! EWMA latency tracking (spec §4.1, secondary signal only).
//!
//! Per spec §4.1 the primary selection signal is priority order; EWMA never
//! reorders providers on its own; it only feeds `performance.avgLatencyMs`
//! (spec §6) and scales the HTTP client's retry backoff (spec §4.6). Kept
//! deliberately decoupled from `router.rs` so provider selection stays
//! deterministic given the same config and request.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, info};

/// EWMA smoothing factor. 0.3 = 30% weight on new sample, 70% on history.
const DEFAULT_EWMA_ALPHA: f64 = 0.3;

/// Minimum samples before a provider's EWMA is considered trustworthy.
const DEFAULT_MIN_SAMPLES: u64 = 3;

/// Penalty multiplier applied to EWMA when a request fails.
const DEFAULT_FAILURE_PENALTY: f64 = 2.0;

#[derive(Debug, Clone)]
struct ProviderLatency {
    ewma: f64,
    samples: u64,
    consecutive_failures: u64,
}

impl ProviderLatency {
    fn new() -> Self {
        ProviderLatency {
            ewma: 0.0,
            samples: 0,
            consecutive_failures: 0,
        }
    }
}

/// EWMA-based latency tracker, one entry per provider id.
#[derive(Debug)]
pub struct EwmaTracker {
    state: RwLock<HashMap<String, ProviderLatency>>,
    alpha: f64,
    min_samples: u64,
    failure_penalty: f64,
}

impl Default for EwmaTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl EwmaTracker {
    pub fn new() -> Self {
        EwmaTracker {
            state: RwLock::new(HashMap::new()),
            alpha: DEFAULT_EWMA_ALPHA,
            min_samples: DEFAULT_MIN_SAMPLES,
            failure_penalty: DEFAULT_FAILURE_PENALTY,
        }
    }

    #[allow(dead_code)]
    pub fn with_params(alpha: f64, min_samples: u64, failure_penalty: f64) -> Self {
        EwmaTracker {
            state: RwLock::new(HashMap::new()),
            alpha: alpha.clamp(0.01, 1.0),
            min_samples: min_samples.max(1),
            failure_penalty: failure_penalty.max(1.0),
        }
    }

    pub fn record_success(&self, provider: &str, duration_secs: f64) {
        let mut state = self.state.write();
        let entry = state.entry(provider.to_string()).or_insert_with(ProviderLatency::new);

        if entry.samples == 0 {
            entry.ewma = duration_secs;
        } else {
            entry.ewma = self.alpha * duration_secs + (1.0 - self.alpha) * entry.ewma;
        }
        entry.samples += 1;
        entry.consecutive_failures = 0;

        debug!(provider, ewma = entry.ewma, samples = entry.samples, "EWMA updated (success)");
    }

    /// Applies a penalty to the EWMA without a wall-clock duration: failure
    /// latency (timeouts, connection refused) doesn't reflect backend speed.
    pub fn record_failure(&self, provider: &str) {
        let mut state = self.state.write();
        let entry = state.entry(provider.to_string()).or_insert_with(ProviderLatency::new);

        entry.consecutive_failures += 1;
        entry.samples += 1;

        if entry.ewma > 0.0 {
            let penalty_duration = entry.ewma * self.failure_penalty;
            entry.ewma = self.alpha * penalty_duration + (1.0 - self.alpha) * entry.ewma;
        }

        debug!(
            provider,
            ewma = entry.ewma,
            consecutive_failures = entry.consecutive_failures,
            "EWMA updated (failure penalty)"
        );
    }

    pub fn get_latency(&self, provider: &str) -> Option<(f64, u64)> {
        let state = self.state.read();
        state.get(provider).map(|s| (s.ewma, s.samples))
    }

    pub fn get_all_latencies(&self) -> Vec<(String, f64, u64)> {
        let state = self.state.read();
        state.iter().map(|(k, v)| (k.clone(), v.ewma, v.samples)).collect()
    }

    /// Weighted average EWMA across every provider with enough samples,
    /// feeding `performance.avgLatencyMs` (spec §6).
    pub fn overall_avg_latency_ms(&self) -> Option<f64> {
        let state = self.state.read();
        let measured: Vec<&ProviderLatency> = state.values().filter(|s| s.samples >= self.min_samples).collect();
        if measured.is_empty() {
            return None;
        }
        let total_samples: u64 = measured.iter().map(|s| s.samples).sum();
        let weighted: f64 = measured.iter().map(|s| s.ewma * s.samples as f64).sum();
        Some((weighted / total_samples as f64) * 1000.0)
    }

    /// Scale factor in `[1.0, failure_penalty]` used by the HTTP client to
    /// stretch retry backoff for a provider trending slow (spec §4.6).
    pub fn backoff_scale(&self, provider: &str, baseline_secs: f64) -> f64 {
        let state = self.state.read();
        match state.get(provider) {
            Some(s) if s.samples >= self.min_samples && baseline_secs > 0.0 => {
                (s.ewma / baseline_secs).clamp(1.0, self.failure_penalty)
            }
            _ => 1.0,
        }
    }
}

/// Scoped timer for measuring per-attempt latency. Drop without recording
/// counts as a failure.
pub struct AttemptTimer<'a> {
    tracker: &'a EwmaTracker,
    provider: String,
    start: Instant,
    recorded: bool,
}

impl<'a> AttemptTimer<'a> {
    pub fn start(tracker: &'a EwmaTracker, provider: &str) -> Self {
        AttemptTimer {
            tracker,
            provider: provider.to_string(),
            start: Instant::now(),
            recorded: false,
        }
    }

    pub fn finish_success(mut self) -> f64 {
        let duration = self.start.elapsed().as_secs_f64();
        self.tracker.record_success(&self.provider, duration);
        self.recorded = true;
        duration
    }

    pub fn finish_failure(mut self) {
        self.tracker.record_failure(&self.provider);
        self.recorded = true;
    }

    #[allow(dead_code)]
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Drop for AttemptTimer<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            info!(
                provider = self.provider,
                elapsed = self.start.elapsed().as_secs_f64(),
                "AttemptTimer dropped without recording, treating as failure"
            );
            self.tracker.record_failure(&self.provider);
        }
    }
}
