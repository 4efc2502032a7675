//! Response cache and general-purpose L1/L2 cache (spec §4.4).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::canonical::{CanonicalRequest, CanonicalResponse};

const RESPONSE_CACHE_MAX_ENTRIES: usize = 500;
const RESPONSE_CACHE_MAX_BYTES: usize = 50 * 1024 * 1024;
const RESPONSE_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

const L1_MAX_ENTRIES: usize = 100;
const L1_TTL: Duration = Duration::from_secs(60);
const L2_MAX_ENTRIES: usize = 1000;
const L2_TTL: Duration = Duration::from_secs(5 * 60);

/// Deterministic fingerprint of `{model, messages, temperature,
/// maxTokens}` under stable key ordering, satisfying P2 (spec §4.4's
/// "ADDED-7" grounding: `sha2` is used the same way throughout the pack).
pub fn fingerprint(request: &CanonicalRequest) -> String {
    let mut key = Map::new();
    key.insert("model".to_string(), Value::String(request.model.clone()));
    key.insert(
        "messages".to_string(),
        serde_json::to_value(&request.messages).expect("messages always serialize"),
    );
    key.insert(
        "temperature".to_string(),
        request
            .sampling
            .temperature
            .map(Value::from)
            .unwrap_or(Value::Null),
    );
    key.insert(
        "maxTokens".to_string(),
        request
            .sampling
            .max_tokens
            .map(Value::from)
            .unwrap_or(Value::Null),
    );
    // `serde_json::Map` defaults to a `BTreeMap` backend (the `preserve_order`
    // feature is not enabled here), which gives the stable key ordering P2
    // requires without any extra bookkeeping.
    let canonical = Value::Object(key).to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

struct ResponseEntry {
    response: CanonicalResponse,
    inserted_at: Instant,
    size_bytes: usize,
    last_used: Instant,
}

/// Size- and TTL-bounded LRU of upstream responses, keyed by `fingerprint`.
/// Never probed or populated for streaming requests (P5).
pub struct ResponseCache {
    entries: Mutex<HashMap<String, ResponseEntry>>,
    max_entries: usize,
    max_bytes: usize,
    ttl: Duration,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    pub fn new() -> Self {
        ResponseCache {
            entries: Mutex::new(HashMap::new()),
            max_entries: RESPONSE_CACHE_MAX_ENTRIES,
            max_bytes: RESPONSE_CACHE_MAX_BYTES,
            ttl: RESPONSE_CACHE_TTL,
        }
    }

    pub fn get(&self, key: &str) -> Option<CanonicalResponse> {
        let mut entries = self.entries.lock();
        let expired = matches!(entries.get(key), Some(e) if e.inserted_at.elapsed() >= self.ttl);
        if expired {
            entries.remove(key);
            return None;
        }
        let entry = entries.get_mut(key)?;
        entry.last_used = Instant::now();
        Some(entry.response.clone())
    }

    pub fn put(&self, key: String, response: CanonicalResponse) {
        let size_bytes = serde_json::to_vec(&response).map(|v| v.len()).unwrap_or(0);
        let mut entries = self.entries.lock();
        entries.insert(
            key,
            ResponseEntry { response, inserted_at: Instant::now(), size_bytes, last_used: Instant::now() },
        );
        Self::evict(&mut entries, self.max_entries, self.max_bytes);
    }

    fn evict(entries: &mut HashMap<String, ResponseEntry>, max_entries: usize, max_bytes: usize) {
        loop {
            let total_bytes: usize = entries.values().map(|e| e.size_bytes).sum();
            if entries.len() <= max_entries && total_bytes <= max_bytes {
                break;
            }
            let Some(lru_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            entries.remove(&lru_key);
        }
    }

    pub fn flush(&self) {
        self.entries.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        CacheStats {
            entries: entries.len(),
            bytes: entries.values().map(|e| e.size_bytes).sum(),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
}

struct GeneralEntry {
    value: Value,
    inserted_at: Instant,
}

struct Tier {
    entries: HashMap<String, GeneralEntry>,
    max_entries: usize,
    ttl: Duration,
}

impl Tier {
    fn new(max_entries: usize, ttl: Duration) -> Self {
        Tier { entries: HashMap::new(), max_entries, ttl }
    }

    fn get(&mut self, key: &str) -> Option<Value> {
        let expired = matches!(self.entries.get(key), Some(e) if e.inserted_at.elapsed() >= self.ttl);
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|e| e.value.clone())
    }

    fn put(&mut self, key: String, value: Value) {
        self.entries.insert(key, GeneralEntry { value, inserted_at: Instant::now() });
        if self.entries.len() > self.max_entries {
            if let Some(oldest_key) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest_key);
            }
        }
    }
}

/// L1 (100 entries, 1 min) + L2 (1000 entries, 5 min) general-purpose
/// cache. Gets probe L1 then L2; an L2 hit is promoted to L1 (spec §4.4).
pub struct TieredCache {
    l1: Mutex<Tier>,
    l2: Mutex<Tier>,
}

impl Default for TieredCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TieredCache {
    pub fn new() -> Self {
        TieredCache {
            l1: Mutex::new(Tier::new(L1_MAX_ENTRIES, L1_TTL)),
            l2: Mutex::new(Tier::new(L2_MAX_ENTRIES, L2_TTL)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.l1.lock().get(key) {
            return Some(value);
        }
        let value = self.l2.lock().get(key)?;
        self.l1.lock().put(key.to_string(), value.clone());
        Some(value)
    }

    pub fn put_l1(&self, key: String, value: Value) {
        self.l1.lock().put(key, value);
    }

    pub fn put_l2(&self, key: String, value: Value) {
        self.l2.lock().put(key, value);
    }

    /// Memory-pressure relief: drop L2 entirely, keep L1 (spec §4.4).
    pub fn drop_l2(&self) {
        *self.l2.lock() = Tier::new(L2_MAX_ENTRIES, L2_TTL);
    }
}

/// Approximates heap pressure from tracked cache sizes (ADDED-7's
/// resolution of the portable-heap-introspection Open Question, recorded
/// in DESIGN.md): stable Rust has no portable way to read heap-used vs
/// heap-total without an allocator shim, so pressure is modeled as the
/// response cache's byte usage against its own configured ceiling plus a
/// fixed per-entry cost for the L1/L2 tiers.
pub fn approximate_heap_pressure(response_cache: &ResponseCache, tiered: &TieredCache) -> f64 {
    const ASSUMED_ENTRY_BYTES: usize = 2048;
    let response_stats = response_cache.stats();
    let l1_len = tiered.l1.lock().entries.len();
    let l2_len = tiered.l2.lock().entries.len();
    let used = response_stats.bytes + (l1_len + l2_len) * ASSUMED_ENTRY_BYTES;
    let total = RESPONSE_CACHE_MAX_BYTES + (L1_MAX_ENTRIES + L2_MAX_ENTRIES) * ASSUMED_ENTRY_BYTES;
    used as f64 / total as f64
}

/// Runs every 10s; when pressure exceeds 0.8 drops L2 and flushes the
/// response cache (spec §4.4).
pub async fn run_memory_watchdog(response_cache: std::sync::Arc<ResponseCache>, tiered: std::sync::Arc<TieredCache>) {
    const THRESHOLD: f64 = 0.8;
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    loop {
        interval.tick().await;
        let pressure = approximate_heap_pressure(&response_cache, &tiered);
        if pressure > THRESHOLD {
            tracing::warn!(pressure, "memory pressure watchdog tripped, dropping L2 and flushing response cache");
            tiered.drop_l2();
            response_cache.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::{Content, Message, Role, SamplingParams};

    fn request(temperature: Option<f32>) -> CanonicalRequest {
        CanonicalRequest {
            model: "claude-3-5-sonnet-20241022".into(),
            messages: vec![Message { role: Role::User, content: Content::Text("hi".into()) }],
            system: None,
            sampling: SamplingParams { temperature, ..Default::default() },
            stream: false,
            metadata: Default::default(),
        }
    }

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(fingerprint(&request(Some(0.5))), fingerprint(&request(Some(0.5))));
    }

    #[test]
    fn fingerprint_changes_with_temperature() {
        assert_ne!(fingerprint(&request(Some(0.5))), fingerprint(&request(Some(0.6))));
    }

    #[test]
    fn response_cache_hit_then_miss_after_flush() {
        let cache = ResponseCache::new();
        let key = fingerprint(&request(None));
        cache.put(key.clone(), CanonicalResponse::text("id1", "m", "hi"));
        assert!(cache.get(&key).is_some());
        cache.flush();
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn l2_hit_promotes_to_l1() {
        let tiered = TieredCache::new();
        tiered.put_l2("k".into(), serde_json::json!("v"));
        assert!(tiered.l1.lock().get("k").is_none());
        assert_eq!(tiered.get("k"), Some(serde_json::json!("v")));
        assert!(tiered.l1.lock().get("k").is_some());
    }

    #[test]
    fn eviction_keeps_entries_within_count_bound() {
        let entries = {
            let mut map = HashMap::new();
            for i in 0..5 {
                map.insert(
                    format!("k{i}"),
                    ResponseEntry {
                        response: CanonicalResponse::text("id", "m", "x"),
                        inserted_at: Instant::now(),
                        size_bytes: 10,
                        last_used: Instant::now() - Duration::from_secs(5 - i as u64),
                    },
                );
            }
            map
        };
        let mut entries = entries;
        ResponseCache::evict(&mut entries, 3, usize::MAX);
        assert_eq!(entries.len(), 3);
    }
}
