//! Cache Tier
//!
//! Three independent caches, each built on moka:
//!
//! - Response cache: SHA256(task + context) -> answer, TTL (default 1h),
//!   tracks hit count and last-hit time per entry
//! - Embedding cache: SHA256(text) -> vector, LRU bounded, never expires
//! - Agent-selection cache: (task hash, type filter) -> agent id, TTL (default 2h)
//!
//! Expiry is checked against an injectable [`crate::clock::Clock`] on every read, so an
//! entry is never returned past its TTL even before moka's own timer evicts
//! it. Expired entries are removed lazily on the read that finds them.

use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::clock::SharedClock;
use crate::router::Route;

/// Capacity and TTL for each tier
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub response_capacity: u64,
    pub response_ttl: Duration,
    pub embedding_capacity: u64,
    pub selection_capacity: u64,
    pub selection_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            response_capacity: 1000,
            response_ttl: Duration::from_secs(3600),
            embedding_capacity: 10_000,
            selection_capacity: 500,
            selection_ttl: Duration::from_secs(7200),
        }
    }
}

/// Cache statistics for one tier
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub tier: &'static str,
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_percent: f64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Counters {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self, tier: &'static str, entries: u64) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            tier,
            entries,
            hits,
            misses,
            hit_rate_percent: if total > 0 {
                (hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        }
    }

    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// SHA256 of trimmed, lower-cased text
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.trim().to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Cached task answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub content: String,
    pub route: Route,
    pub agent_id: Option<i64>,
    pub agent_name: Option<String>,
    pub tokens_used: u64,
}

/// A response cache hit with its observability counters
#[derive(Debug, Clone)]
pub struct ResponseHit {
    pub response: CachedResponse,
    pub hit_count: u64,
    pub last_hit_at: DateTime<Utc>,
}

#[derive(Clone)]
struct ResponseSlot {
    response: CachedResponse,
    expires_at: DateTime<Utc>,
    hit_count: Arc<AtomicU64>,
    last_hit_at: Arc<Mutex<Option<DateTime<Utc>>>>,
}

/// Response cache with TTL expiry
#[derive(Clone)]
pub struct ResponseCache {
    cache: Cache<String, ResponseSlot>,
    ttl: chrono::Duration,
    clock: SharedClock,
    counters: Arc<Counters>,
}

impl ResponseCache {
    pub fn new(max_entries: u64, ttl: Duration, clock: SharedClock) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self {
            cache,
            ttl: to_chrono(ttl),
            clock,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Compute cache key from task text and the request context that shapes the answer
    ///
    /// Key = SHA256(normalized_task + each context part)
    pub fn compute_key(task: &str, context: &[&str]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(task.trim().to_lowercase().as_bytes());
        for part in context {
            hasher.update(b"\x1f");
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub async fn get(&self, key: &str) -> Option<ResponseHit> {
        let Some(slot) = self.cache.get(key).await else {
            self.counters.miss();
            debug!("Response cache MISS: {}", short(key));
            return None;
        };

        let now = self.clock.now();
        if now >= slot.expires_at {
            self.cache.invalidate(key).await;
            self.counters.miss();
            debug!("Response cache EXPIRED: {}", short(key));
            return None;
        }

        let hit_count = slot.hit_count.fetch_add(1, Ordering::Relaxed) + 1;
        *slot.last_hit_at.lock() = Some(now);
        self.counters.hit();
        debug!("Response cache HIT: {} ({} hits)", short(key), hit_count);

        Some(ResponseHit {
            response: slot.response,
            hit_count,
            last_hit_at: now,
        })
    }

    /// Store a response, overwriting any previous entry for the key
    pub async fn set(&self, key: &str, response: CachedResponse) {
        let slot = ResponseSlot {
            response,
            expires_at: self.clock.now() + self.ttl,
            hit_count: Arc::new(AtomicU64::new(0)),
            last_hit_at: Arc::new(Mutex::new(None)),
        };
        self.cache.insert(key.to_string(), slot).await;
        debug!("Response cache SET: {}", short(key));
    }

    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.stats("response", self.cache.entry_count())
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.counters.reset();
    }

    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

/// Embedding cache, LRU bounded, no expiry
#[derive(Clone)]
pub struct EmbeddingCache {
    cache: Cache<String, Arc<Vec<f32>>>,
    counters: Arc<Counters>,
}

impl EmbeddingCache {
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Self {
            cache,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Key is the SHA256 of the exact (trimmed) text
    pub fn key_for(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.trim().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn get(&self, text: &str) -> Option<Arc<Vec<f32>>> {
        match self.cache.get(&Self::key_for(text)).await {
            Some(embedding) => {
                self.counters.hit();
                Some(embedding)
            }
            None => {
                self.counters.miss();
                None
            }
        }
    }

    pub async fn insert(&self, text: &str, embedding: Arc<Vec<f32>>) {
        self.cache.insert(Self::key_for(text), embedding).await;
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.stats("embedding", self.cache.entry_count())
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.counters.reset();
    }

    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[derive(Clone, Copy)]
struct SelectionSlot {
    agent_id: i64,
    expires_at: DateTime<Utc>,
}

/// Agent-selection cache with TTL expiry
#[derive(Clone)]
pub struct SelectionCache {
    cache: Cache<String, SelectionSlot>,
    ttl: chrono::Duration,
    clock: SharedClock,
    counters: Arc<Counters>,
}

impl SelectionCache {
    pub fn new(max_entries: u64, ttl: Duration, clock: SharedClock) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self {
            cache,
            ttl: to_chrono(ttl),
            clock,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Key = (task hash, type filter)
    pub fn key_for(task: &str, type_filter: Option<&str>) -> String {
        format!("{}:{}", hash_text(task), type_filter.unwrap_or("*"))
    }

    pub async fn get(&self, task: &str, type_filter: Option<&str>) -> Option<i64> {
        let key = Self::key_for(task, type_filter);
        let Some(slot) = self.cache.get(&key).await else {
            self.counters.miss();
            return None;
        };

        if self.clock.now() >= slot.expires_at {
            self.cache.invalidate(&key).await;
            self.counters.miss();
            return None;
        }

        self.counters.hit();
        Some(slot.agent_id)
    }

    pub async fn insert(&self, task: &str, type_filter: Option<&str>, agent_id: i64) {
        let slot = SelectionSlot {
            agent_id,
            expires_at: self.clock.now() + self.ttl,
        };
        self.cache
            .insert(Self::key_for(task, type_filter), slot)
            .await;
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.stats("agent_selection", self.cache.entry_count())
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.counters.reset();
    }

    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

/// The three tiers, constructed once at startup and shared by reference
#[derive(Clone)]
pub struct CacheTier {
    pub responses: ResponseCache,
    pub embeddings: EmbeddingCache,
    pub selections: SelectionCache,
}

impl CacheTier {
    pub fn new(config: &CacheConfig, clock: SharedClock) -> Self {
        Self {
            responses: ResponseCache::new(
                config.response_capacity,
                config.response_ttl,
                clock.clone(),
            ),
            embeddings: EmbeddingCache::new(config.embedding_capacity),
            selections: SelectionCache::new(
                config.selection_capacity,
                config.selection_ttl,
                clock,
            ),
        }
    }

    pub fn stats(&self) -> Vec<CacheStats> {
        vec![
            self.responses.stats(),
            self.embeddings.stats(),
            self.selections.stats(),
        ]
    }

    pub async fn run_pending_tasks(&self) {
        self.responses.run_pending_tasks().await;
        self.embeddings.run_pending_tasks().await;
        self.selections.run_pending_tasks().await;
    }
}

fn short(key: &str) -> &str {
    &key[..16.min(key.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn response(content: &str) -> CachedResponse {
        CachedResponse {
            content: content.to_string(),
            route: Route::LocalModel,
            agent_id: None,
            agent_name: None,
            tokens_used: 10,
        }
    }

    #[tokio::test]
    async fn test_response_hit_miss() {
        let clock = ManualClock::default();
        let cache = ResponseCache::new(100, Duration::from_secs(3600), Arc::new(clock));
        let key = ResponseCache::compute_key("test query", &["local_model"]);

        assert!(cache.get(&key).await.is_none());

        cache.set(&key, response("answer")).await;

        let hit = cache.get(&key).await.unwrap();
        assert_eq!(hit.response.content, "answer");
        assert_eq!(hit.hit_count, 1);

        let hit = cache.get(&key).await.unwrap();
        assert_eq!(hit.hit_count, 2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_response_read_after_expiry_is_miss() {
        let clock = ManualClock::default();
        let cache = ResponseCache::new(100, Duration::from_secs(60), Arc::new(clock.clone()));
        let key = ResponseCache::compute_key("q", &[]);

        cache.set(&key, response("a")).await;
        clock.advance_secs(59);
        assert!(cache.get(&key).await.is_some());

        clock.advance_secs(1);
        assert!(cache.get(&key).await.is_none());
        // lazily removed, so a later read is still a miss
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_response_write_overwrites_and_resets_ttl() {
        let clock = ManualClock::default();
        let cache = ResponseCache::new(100, Duration::from_secs(60), Arc::new(clock.clone()));
        let key = ResponseCache::compute_key("q", &[]);

        cache.set(&key, response("old")).await;
        clock.advance_secs(50);
        cache.set(&key, response("new")).await;
        clock.advance_secs(50);

        let hit = cache.get(&key).await.unwrap();
        assert_eq!(hit.response.content, "new");
        assert_eq!(hit.hit_count, 1);
    }

    #[test]
    fn test_key_consistency() {
        let key1 = ResponseCache::compute_key("hello", &["sys"]);
        let key2 = ResponseCache::compute_key("  HELLO ", &["sys"]);
        let key3 = ResponseCache::compute_key("hello", &["other"]);
        let key4 = ResponseCache::compute_key("hello", &[]);

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
        assert_ne!(key1, key4);
    }

    #[tokio::test]
    async fn test_embedding_cache_never_expires() {
        let cache = EmbeddingCache::new(10);
        cache.insert("text", Arc::new(vec![1.0, 2.0])).await;

        assert_eq!(cache.get("text").await.unwrap().as_slice(), &[1.0, 2.0]);
        assert_eq!(cache.get(" text ").await.unwrap().as_slice(), &[1.0, 2.0]);
        assert!(cache.get("other").await.is_none());
    }

    #[tokio::test]
    async fn test_embedding_cache_is_capacity_bounded() {
        let cache = EmbeddingCache::new(2);
        cache.insert("a", Arc::new(vec![1.0])).await;
        cache.insert("b", Arc::new(vec![2.0])).await;
        cache.insert("c", Arc::new(vec![3.0])).await;
        cache.run_pending_tasks().await;

        assert!(cache.stats().entries <= 2);
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn test_selection_cache_ttl_and_filter() {
        let clock = ManualClock::default();
        let cache = SelectionCache::new(10, Duration::from_secs(7200), Arc::new(clock.clone()));

        cache.insert("review this", Some("code_review"), 7).await;

        assert_eq!(cache.get("review this", Some("code_review")).await, Some(7));
        assert_eq!(cache.get("Review This", Some("code_review")).await, Some(7));
        assert_eq!(cache.get("review this", None).await, None);
        assert_eq!(cache.get("review this", Some("testing")).await, None);

        clock.advance_secs(7200);
        assert_eq!(cache.get("review this", Some("code_review")).await, None);
    }

    #[tokio::test]
    async fn test_tier_stats() {
        let tier = CacheTier::new(&CacheConfig::default(), Arc::new(ManualClock::default()));
        tier.embeddings.insert("x", Arc::new(vec![0.5])).await;
        tier.embeddings.get("x").await;
        tier.run_pending_tasks().await;

        let stats = tier.stats();
        assert_eq!(stats.len(), 3);
        let embedding = stats.iter().find(|s| s.tier == "embedding").unwrap();
        assert_eq!(embedding.hits, 1);
        assert_eq!(embedding.entries, 1);
    }
}
