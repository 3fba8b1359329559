//! Response cache - single-process LRU with per-entry TTL
//!
//! Admission is GET-only and policy-driven by URL prefix; keys are an md5
//! fingerprint of verb, normalized path, canonical query and the user id.
//! Sensitive fields are stripped before storage. Cache failures never fail a
//! job: callers log and proceed as a miss.

use cg_common::Job;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use utoipa::ToSchema;

/// Path prefixes whose responses are never cached (real-time jobs, health,
/// metrics, admin surfaces, auth mutation). Per-user auth reads like
/// `/auth/profile` stay cacheable: the fingerprint already folds in the
/// user id.
pub const CACHE_EXCLUSIONS: &[&str] = &[
    "/realtime",
    "/health",
    "/metrics",
    "/monitoring",
    "/admin",
    "/auth/register",
    "/auth/login",
    "/auth/refresh",
    "/auth/logout",
    "/queues",
    "/queue-control",
    "/jobs",
];

/// Keys stripped from results before storage.
const SENSITIVE_FIELDS: &[&str] = &["token", "password", "jwt"];

const RESPONSE_TIME_WINDOW: usize = 100;

/// Capability interface for the response cache, so a distributed cache can
/// replace the in-process LRU without touching the job processor.
pub trait ResponseCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value, ttl: Duration);

    /// Drop expired entries, returning how many were evicted.
    fn cleanup(&self) -> usize;

    fn record_response_time(&self, elapsed_ms: u64);

    fn metrics(&self) -> CacheMetricsSnapshot;

    fn reset_metrics(&self);
}

// ============================================================================
// Policy
// ============================================================================

/// Only GET requests on non-excluded paths are cacheable.
pub fn admits(job: &Job) -> bool {
    if job.verb != cg_common::Verb::GET {
        return false;
    }
    !CACHE_EXCLUSIONS
        .iter()
        .any(|prefix| job.normalized_path.starts_with(prefix))
}

/// TTL policy by URL prefix: static catalog data 15 min, user-scoped lists
/// 5 min, volatile data 1 min, default 5 min.
pub fn ttl_for_path(path: &str) -> Duration {
    const STATIC_PREFIXES: &[&str] = &[
        "/courses",
        "/programs",
        "/subjects",
        "/rooms",
        "/course-sections",
        "/calendar/periods",
    ];
    const USER_PREFIXES: &[&str] = &[
        "/students",
        "/teachers",
        "/grades",
        "/schedules",
        "/academic-history",
        "/academic-performance",
    ];
    const VOLATILE_PREFIXES: &[&str] = &[
        "/enrollments",
        "/enrollment-details",
        "/assessments",
        "/activity",
        "/notifications",
    ];

    if STATIC_PREFIXES.iter().any(|p| path.starts_with(p)) {
        Duration::from_secs(15 * 60)
    } else if USER_PREFIXES.iter().any(|p| path.starts_with(p)) {
        Duration::from_secs(5 * 60)
    } else if VOLATILE_PREFIXES.iter().any(|p| path.starts_with(p)) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(5 * 60)
    }
}

/// Fingerprint: `http:md5(VERB ':' path ':' canonicalQuery [':user:' userId])`.
pub fn cache_key(job: &Job) -> String {
    let mut raw = format!(
        "{}:{}:{}",
        job.verb,
        job.normalized_path,
        canonical_query(job)
    );
    if let Some(user_id) = &job.user_id {
        raw.push_str(":user:");
        raw.push_str(user_id);
    }
    format!("http:{:x}", md5::compute(raw.as_bytes()))
}

/// Canonical query form: keys sorted lexicographically, each key's values
/// sorted, one `k=v` pair per value, joined with `&`.
fn canonical_query(job: &Job) -> String {
    let mut pairs: Vec<String> = Vec::new();
    let mut keys: Vec<&String> = job.query_params.keys().collect();
    keys.sort();
    for key in keys {
        let mut values = job.query_params[key.as_str()].clone();
        values.sort();
        for value in values {
            pairs.push(format!("{}={}", key, value));
        }
    }
    pairs.join("&")
}

/// Strip sensitive fields recursively and mark the object as cached.
pub fn sanitize_for_cache(value: &Value) -> Value {
    let mut cleaned = redact_sensitive(value);
    if let Value::Object(map) = &mut cleaned {
        map.insert(
            "_cache".to_string(),
            serde_json::json!({
                "cached": true,
                "cachedAt": Utc::now().timestamp_millis(),
            }),
        );
    }
    cleaned
}

fn redact_sensitive(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                if SENSITIVE_FIELDS
                    .iter()
                    .any(|f| k.eq_ignore_ascii_case(f))
                {
                    continue;
                }
                out.insert(k.clone(), redact_sensitive(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_sensitive).collect()),
        other => other.clone(),
    }
}

// ============================================================================
// LRU Implementation
// ============================================================================

struct CacheEntry {
    value: Value,
    expires_at: Instant,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    /// Approximate serialized size in bytes.
    size: usize,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    total_operations: u64,
    response_times: VecDeque<u64>,
    last_cleanup: Option<i64>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub size: usize,
    pub max_size: usize,
    /// Sum of per-entry size approximations, in bytes.
    pub memory_usage_bytes: usize,
    pub avg_response_time_ms: f64,
    pub total_operations: u64,
    pub evictions: u64,
    /// Epoch milliseconds of the last expiry sweep.
    pub last_cleanup: Option<i64>,
}

pub struct LruResponseCache {
    max_size: usize,
    state: Mutex<CacheState>,
}

impl LruResponseCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
                total_operations: 0,
                response_times: VecDeque::new(),
                last_cleanup: None,
            }),
        }
    }

    fn evict_lru(state: &mut CacheState) {
        let lru_key = state
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, _)| key.clone());
        if let Some(key) = lru_key {
            state.entries.remove(&key);
            state.evictions += 1;
        }
    }
}

impl ResponseCache for LruResponseCache {
    fn get(&self, key: &str) -> Option<Value> {
        let mut state = self.state.lock();
        state.total_operations += 1;
        let now = Instant::now();

        enum Lookup {
            Hit(Value),
            Expired,
            Miss,
        }

        let lookup = match state.entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_accessed = now;
                entry.access_count += 1;
                Lookup::Hit(entry.value.clone())
            }
            Some(_) => Lookup::Expired,
            None => Lookup::Miss,
        };

        match lookup {
            Lookup::Hit(value) => {
                state.hits += 1;
                Some(value)
            }
            Lookup::Expired => {
                state.entries.remove(key);
                state.misses += 1;
                None
            }
            Lookup::Miss => {
                state.misses += 1;
                None
            }
        }
    }

    fn set(&self, key: &str, value: Value, ttl: Duration) {
        let cleaned = sanitize_for_cache(&value);
        let size = serde_json::to_string(&cleaned).map(|s| s.len()).unwrap_or(0);
        let now = Instant::now();

        let mut state = self.state.lock();
        state.total_operations += 1;

        if !state.entries.contains_key(key) && state.entries.len() >= self.max_size {
            Self::evict_lru(&mut state);
        }

        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value: cleaned,
                expires_at: now + ttl,
                created_at: now,
                last_accessed: now,
                access_count: 0,
                size,
            },
        );
    }

    fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - state.entries.len();
        state.evictions += removed as u64;
        state.last_cleanup = Some(Utc::now().timestamp_millis());
        if removed > 0 {
            debug!(removed = removed, "Cache expiry sweep");
        }
        removed
    }

    fn record_response_time(&self, elapsed_ms: u64) {
        let mut state = self.state.lock();
        if state.response_times.len() >= RESPONSE_TIME_WINDOW {
            state.response_times.pop_front();
        }
        state.response_times.push_back(elapsed_ms);
    }

    fn metrics(&self) -> CacheMetricsSnapshot {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            state.hits as f64 / lookups as f64
        };
        let avg_response_time_ms = if state.response_times.is_empty() {
            0.0
        } else {
            state.response_times.iter().sum::<u64>() as f64 / state.response_times.len() as f64
        };

        CacheMetricsSnapshot {
            hits: state.hits,
            misses: state.misses,
            hit_rate,
            size: state.entries.len(),
            max_size: self.max_size,
            memory_usage_bytes: state.entries.values().map(|e| e.size).sum(),
            avg_response_time_ms,
            total_operations: state.total_operations,
            evictions: state.evictions,
            last_cleanup: state.last_cleanup,
        }
    }

    fn reset_metrics(&self) {
        let mut state = self.state.lock();
        state.hits = 0;
        state.misses = 0;
        state.evictions = 0;
        state.total_operations = 0;
        state.response_times.clear();
    }
}

/// Background task sweeping expired entries.
pub fn spawn_cache_cleanup(
    cache: Arc<dyn ResponseCache>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            cache.cleanup();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::make_job_at;
    use cg_common::Verb;
    use serde_json::json;

    #[test]
    fn admits_only_get_on_non_excluded_paths() {
        assert!(admits(&make_job_at("j", Verb::GET, "/courses")));
        assert!(!admits(&make_job_at("j", Verb::POST, "/courses")));
        assert!(!admits(&make_job_at("j", Verb::GET, "/admin/queues")));
        assert!(!admits(&make_job_at("j", Verb::GET, "/auth/refresh")));
        assert!(!admits(&make_job_at("j", Verb::GET, "/health")));
        // Per-user auth reads are cacheable; the key carries the user id.
        assert!(admits(&make_job_at("j", Verb::GET, "/auth/profile")));
    }

    #[test]
    fn ttl_policy_by_prefix() {
        assert_eq!(ttl_for_path("/courses"), Duration::from_secs(900));
        assert_eq!(ttl_for_path("/students"), Duration::from_secs(300));
        assert_eq!(ttl_for_path("/enrollments"), Duration::from_secs(60));
        assert_eq!(ttl_for_path("/other"), Duration::from_secs(300));
    }

    #[test]
    fn key_depends_on_user_and_query_order_does_not_matter() {
        let mut a = make_job_at("j", Verb::GET, "/courses");
        a.query_params
            .insert("page".to_string(), vec!["1".to_string()]);
        a.query_params
            .insert("limit".to_string(), vec!["10".to_string()]);

        let mut b = make_job_at("j2", Verb::GET, "/courses");
        b.query_params
            .insert("limit".to_string(), vec!["10".to_string()]);
        b.query_params
            .insert("page".to_string(), vec!["1".to_string()]);

        assert_eq!(cache_key(&a), cache_key(&b));

        let mut c = a.clone();
        c.user_id = Some("u1".to_string());
        assert_ne!(cache_key(&a), cache_key(&c));
        assert!(cache_key(&a).starts_with("http:"));
    }

    #[test]
    fn sensitive_fields_are_stripped_and_entry_marked() {
        let value = json!({
            "user": {"name": "ada", "password": "s3cret", "Token": "t"},
            "jwt": "xyz",
            "items": [{"token": "a", "ok": 1}]
        });
        let cleaned = sanitize_for_cache(&value);
        assert!(cleaned.get("jwt").is_none());
        assert!(cleaned["user"].get("password").is_none());
        assert!(cleaned["user"].get("Token").is_none());
        assert!(cleaned["items"][0].get("token").is_none());
        assert_eq!(cleaned["items"][0]["ok"], 1);
        assert_eq!(cleaned["_cache"]["cached"], true);
    }

    #[test]
    fn get_set_hit_miss_metrics() {
        let cache = LruResponseCache::new(10);
        assert!(cache.get("k").is_none());
        cache.set("k", json!({"a": 1}), Duration::from_secs(60));
        assert!(cache.get("k").is_some());

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert!((metrics.hit_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(metrics.size, 1);
    }

    #[test]
    fn expired_entries_read_as_miss() {
        let cache = LruResponseCache::new(10);
        cache.set("k", json!({"a": 1}), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache = LruResponseCache::new(2);
        cache.set("a", json!(1), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(2));
        cache.set("b", json!(2), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(2));
        // Touch "a" so "b" becomes least recently used.
        let _ = cache.get("a");
        std::thread::sleep(Duration::from_millis(2));
        cache.set("c", json!(3), Duration::from_secs(60));

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.metrics().evictions, 1);
    }

    #[test]
    fn cleanup_counts_evictions_and_stamps() {
        let cache = LruResponseCache::new(10);
        cache.set("k", json!(1), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        let removed = cache.cleanup();
        assert_eq!(removed, 1);
        let metrics = cache.metrics();
        assert_eq!(metrics.evictions, 1);
        assert!(metrics.last_cleanup.is_some());
    }

    #[test]
    fn reset_clears_counters_not_entries() {
        let cache = LruResponseCache::new(10);
        cache.set("k", json!(1), Duration::from_secs(60));
        let _ = cache.get("k");
        cache.reset_metrics();
        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 0);
        assert_eq!(metrics.size, 1);
    }
}
