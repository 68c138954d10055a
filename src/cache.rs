use async_trait::async_trait;
use moka::future::Cache as MokaCache;
use moka::Expiry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Cache statistics for monitoring
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

/// Capability interface for a cache with per-entry time-to-live.
///
/// Components that cache (aggregate reads, search results) receive one of
/// these explicitly instead of reaching for a process-wide map.
#[async_trait]
pub trait ValueCache<K, V>: Send + Sync {
    /// Value for `key`, unless absent or expired.
    async fn get(&self, key: &K) -> Option<V>;

    /// Store `value` under `key` for `ttl`. A zero `ttl` stores nothing.
    async fn set(&self, key: K, value: V, ttl: Duration);

    /// Drop `key` if present.
    async fn invalidate(&self, key: &K);
}

struct Entry<V> {
    value: V,
    ttl: Duration,
}

/// Expires each entry after the TTL it was inserted with.
struct PerEntryTtl;

impl<K, V> Expiry<K, Arc<Entry<V>>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &K,
        value: &Arc<Entry<V>>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &K,
        value: &Arc<Entry<V>>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// A thread-safe cache with per-entry TTL and bounded size.
///
/// Backed by `moka`, which evicts with TinyLFU once `max_entries` is
/// reached and expires entries without full scans.
pub struct Cache<K, V> {
    inner: MokaCache<K, Arc<Entry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    default_ttl: Duration,
}

impl<K, V> Cache<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a new cache with the specified maximum size and default TTL
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        let inner = MokaCache::builder()
            .max_capacity(max_entries as u64)
            .expire_after(PerEntryTtl)
            .build();

        Self {
            inner,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            default_ttl,
        }
    }

    /// Get a value from the cache.
    /// Returns None if the key is not found or the entry has expired.
    pub async fn get(&self, key: &K) -> Option<V> {
        match self.inner.get(key).await {
            Some(entry) => {
                trace!("Cache hit for key");
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            None => {
                trace!("Cache miss for key");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a value with the default TTL.
    pub async fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl).await;
    }

    /// Insert a value that expires after `ttl`.
    pub async fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        if ttl.is_zero() {
            self.inner.invalidate(&key).await;
            return;
        }
        self.inner.insert(key, Arc::new(Entry { value, ttl })).await;
        trace!(ttl_ms = ttl.as_millis() as u64, "Inserted value into cache");
    }

    /// Remove a specific entry, returning its value if it was live.
    pub async fn remove(&self, key: &K) -> Option<V> {
        self.inner.remove(key).await.map(|entry| entry.value.clone())
    }

    /// Clear all entries from the cache
    pub async fn clear(&self) {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks().await;
    }

    /// Check if a key is live without touching hit/miss statistics.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        self.inner.run_pending_tasks().await;
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.inner.entry_count() as usize,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }
}

impl<K, V> Default for Cache<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(1000, Duration::from_secs(300))
    }
}

#[async_trait]
impl<K, V> ValueCache<K, V> for Cache<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Option<V> {
        Cache::get(self, key).await
    }

    async fn set(&self, key: K, value: V, ttl: Duration) {
        self.insert_with_ttl(key, value, ttl).await;
    }

    async fn invalidate(&self, key: &K) {
        self.inner.invalidate(key).await;
    }
}
