//! Per-provider circuit breaker (spec §4.6).
//!
//! Tracks a 10-bucket, 10-second rolling error-rate window per provider.
//! Opens when the error rate exceeds 50% with at least a handful of
//! samples, stays open for 30s, then allows a single half-open probe.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use parking_lot::RwLock;
use prometheus::{register_counter_vec, register_gauge_vec, CounterVec, GaugeVec};

const WINDOW_SECS: u64 = 10;
const BUCKET_COUNT: usize = 10;
const BUCKET_WIDTH: Duration = Duration::from_millis(WINDOW_SECS * 1000 / BUCKET_COUNT as u64);
const OPEN_DURATION: Duration = Duration::from_secs(30);
const ERROR_RATE_THRESHOLD: f64 = 0.5;
const MIN_SAMPLES: u32 = 4;

lazy_static! {
    static ref CIRCUIT_STATE: GaugeVec = register_gauge_vec!(
        "ucr_circuit_state",
        "Circuit breaker state per provider (0=closed, 1=open, 2=half_open)",
        &["provider"]
    )
    .unwrap();
    static ref CIRCUIT_TRIPS_TOTAL: CounterVec = register_counter_vec!(
        "ucr_circuit_trips_total",
        "Total number of times a provider's circuit opened",
        &["provider"]
    )
    .unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    start: Option<Instant>,
    successes: u32,
    errors: u32,
}

#[derive(Debug)]
struct ProviderState {
    buckets: [Bucket; BUCKET_COUNT],
    opened_at: Option<Instant>,
    half_open_probe_in_flight: bool,
}

impl Default for ProviderState {
    fn default() -> Self {
        ProviderState {
            buckets: [Bucket::default(); BUCKET_COUNT],
            opened_at: None,
            half_open_probe_in_flight: false,
        }
    }
}

impl ProviderState {
    fn current_bucket(&mut self, now: Instant) -> &mut Bucket {
        let idx = (epoch_millis(now) / BUCKET_WIDTH.as_millis() as u64) as usize % BUCKET_COUNT;
        let bucket = &mut self.buckets[idx];
        let stale = match bucket.start {
            Some(start) => now.duration_since(start) >= Duration::from_secs(WINDOW_SECS),
            None => true,
        };
        if stale {
            *bucket = Bucket {
                start: Some(now),
                successes: 0,
                errors: 0,
            };
        }
        bucket
    }

    fn window_totals(&self, now: Instant) -> (u32, u32) {
        let mut successes = 0;
        let mut errors = 0;
        for bucket in &self.buckets {
            if let Some(start) = bucket.start {
                if now.duration_since(start) < Duration::from_secs(WINDOW_SECS) {
                    successes += bucket.successes;
                    errors += bucket.errors;
                }
            }
        }
        (successes, errors)
    }

    fn state(&self, now: Instant) -> CircuitState {
        match self.opened_at {
            Some(opened_at) if now.duration_since(opened_at) < OPEN_DURATION => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
            None => CircuitState::Closed,
        }
    }
}

fn epoch_millis(now: Instant) -> u64 {
    // Monotonic, not wall-clock: bucketing only needs a stable increasing
    // counter, and `Instant` has no epoch, so anchor to the process start.
    lazy_static! {
        static ref START: Instant = Instant::now();
    }
    now.duration_since(*START).as_millis() as u64
}

/// Tracks circuit state for every provider the router has seen.
#[derive(Default)]
pub struct CircuitBreaker {
    providers: RwLock<HashMap<String, ProviderState>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Err` if the provider's circuit is open and no half-open
    /// probe slot is available.
    pub fn allow(&self, provider: &str) -> Result<(), crate::error::AppError> {
        let now = Instant::now();
        let mut providers = self.providers.write();
        let state = providers.entry(provider.to_string()).or_default();

        match state.state(now) {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(crate::error::AppError::CircuitOpen(provider.to_string())),
            CircuitState::HalfOpen => {
                if state.half_open_probe_in_flight {
                    Err(crate::error::AppError::CircuitOpen(provider.to_string()))
                } else {
                    state.half_open_probe_in_flight = true;
                    CIRCUIT_STATE.with_label_values(&[provider]).set(2.0);
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self, provider: &str) {
        let now = Instant::now();
        let mut providers = self.providers.write();
        let state = providers.entry(provider.to_string()).or_default();
        state.current_bucket(now).successes += 1;

        if state.state(now) == CircuitState::HalfOpen {
            // Probe succeeded: close the circuit.
            state.opened_at = None;
            state.half_open_probe_in_flight = false;
            state.buckets = [Bucket::default(); BUCKET_COUNT];
            CIRCUIT_STATE.with_label_values(&[provider]).set(0.0);
            tracing::info!(provider, "circuit closed after successful probe");
        }
    }

    pub fn record_error(&self, provider: &str) {
        let now = Instant::now();
        let mut providers = self.providers.write();
        let state = providers.entry(provider.to_string()).or_default();
        state.current_bucket(now).errors += 1;

        if state.state(now) == CircuitState::HalfOpen {
            // Probe failed: stay open for another full window.
            state.opened_at = Some(now);
            state.half_open_probe_in_flight = false;
            CIRCUIT_STATE.with_label_values(&[provider]).set(1.0);
            tracing::warn!(provider, "half-open probe failed, circuit re-opened");
            return;
        }

        let (successes, errors) = state.window_totals(now);
        let total = successes + errors;
        if total >= MIN_SAMPLES {
            let error_rate = errors as f64 / total as f64;
            if error_rate > ERROR_RATE_THRESHOLD && state.opened_at.is_none() {
                state.opened_at = Some(now);
                CIRCUIT_STATE.with_label_values(&[provider]).set(1.0);
                CIRCUIT_TRIPS_TOTAL.with_label_values(&[provider]).inc();
                tracing::warn!(provider, error_rate, total, "circuit opened");
            }
        }
    }

    pub fn state_of(&self, provider: &str) -> CircuitState {
        let now = Instant::now();
        let providers = self.providers.read();
        providers
            .get(provider)
            .map(|s| s.state(now))
            .unwrap_or(CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_by_default() {
        let cb = CircuitBreaker::new();
        assert!(cb.allow("anthropic").is_ok());
    }

    #[test]
    fn opens_after_majority_errors() {
        let cb = CircuitBreaker::new();
        for _ in 0..MIN_SAMPLES {
            cb.record_error("flaky");
        }
        assert!(matches!(cb.state_of("flaky"), CircuitState::Open));
        assert!(cb.allow("flaky").is_err());
    }

    #[test]
    fn stays_closed_under_threshold() {
        let cb = CircuitBreaker::new();
        cb.record_success("mostly-ok");
        cb.record_success("mostly-ok");
        cb.record_success("mostly-ok");
        cb.record_error("mostly-ok");
        assert!(matches!(cb.state_of("mostly-ok"), CircuitState::Closed));
    }

    #[test]
    fn half_open_probe_closes_circuit_on_success() {
        let cb = CircuitBreaker::new();
        for _ in 0..MIN_SAMPLES {
            cb.record_error("recovering");
        }
        assert!(matches!(cb.state_of("recovering"), CircuitState::Open));

        // Force the window closed by rewinding opened_at manually via a
        // second breaker is not possible across the RwLock boundary, so
        // this test exercises only the immediate post-trip open state and
        // the probe-success-closes transition logic directly.
        {
            let mut providers = cb.providers.write();
            let state = providers.get_mut("recovering").unwrap();
            state.opened_at = Some(Instant::now() - OPEN_DURATION - Duration::from_millis(1));
        }
        assert!(matches!(cb.state_of("recovering"), CircuitState::HalfOpen));
        assert!(cb.allow("recovering").is_ok());
        cb.record_success("recovering");
        assert!(matches!(cb.state_of("recovering"), CircuitState::Closed));
    }

    #[test]
    fn only_one_half_open_probe_at_a_time() {
        let cb = CircuitBreaker::new();
        for _ in 0..MIN_SAMPLES {
            cb.record_error("busy");
        }
        {
            let mut providers = cb.providers.write();
            let state = providers.get_mut("busy").unwrap();
            state.opened_at = Some(Instant::now() - OPEN_DURATION - Duration::from_millis(1));
        }
        assert!(cb.allow("busy").is_ok());
        assert!(cb.allow("busy").is_err());
    }
}
