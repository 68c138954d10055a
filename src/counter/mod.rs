//! Store-backed sharded counters.
//!
//! A counter's value for a parent record is spread over `N` shard records.
//! Writers add to one randomly chosen shard; readers sum every shard. This
//! keeps hot counters (likes, plays, views) from serializing every write on
//! a single document, at the cost of reads that scan `N` records and see no
//! cross-shard snapshot.
//!
//! ```no_run
//! # use loop_counters::{CounterFamily, MemoryStore, ShardedCounter};
//! # use std::sync::Arc;
//! # async fn demo() -> Result<(), loop_counters::CounterError> {
//! let counter = ShardedCounter::new(Arc::new(MemoryStore::new()), CounterFamily::default());
//! counter.increment("posts/p1", "likes").await?;
//! assert_eq!(counter.get_counter_value("posts/p1", "likes").await?, 1);
//! # Ok(())
//! # }
//! ```

mod initializer;
mod reader;
mod writer;

use crate::cache::{Cache, ValueCache};
use crate::config::Config;
use crate::error::{CounterError, CounterResult, StoreError};
use crate::layout::CounterFamily;
use crate::metrics::CounterMetrics;
use crate::store::{DocumentStore, WriteMode};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Aggregated counter values of one parent, keyed by field name.
pub type CounterValues = BTreeMap<String, i64>;

/// Cache of aggregated values, keyed by the parent's shard collection path
/// qualified with the family name and shard count.
pub type AggregateCache = dyn ValueCache<String, CounterValues>;

/// How the writer applies a delta to the chosen shard.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WriteStrategy {
    /// `Upsert` when the store supports it, otherwise `ReadThenWrite`
    #[default]
    Auto,
    /// One conditional server-side create-or-increment
    Upsert,
    /// Read the shard, create it if absent, otherwise atomically increment
    ReadThenWrite,
}

/// Picks the shard a write lands on.
pub trait ShardSelector: Send + Sync {
    /// An index in `[0, shards)`.
    fn pick(&self, shards: u32) -> u32;
}

/// Uniformly random shard choice; needs no coordination between writers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSelector;

impl ShardSelector for RandomSelector {
    fn pick(&self, shards: u32) -> u32 {
        rand::rng().random_range(0..shards)
    }
}

/// Always picks the same shard.
#[derive(Debug, Clone, Copy)]
pub struct FixedSelector(pub u32);

impl ShardSelector for FixedSelector {
    fn pick(&self, _shards: u32) -> u32 {
        self.0
    }
}

/// Cycles through the shards in order.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    next: AtomicU32,
}

impl ShardSelector for RoundRobinSelector {
    fn pick(&self, shards: u32) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed) % shards
    }
}

/// Sharded counter family bound to a document store.
///
/// Initializer, writer and reader all take their shard layout from the
/// same [`CounterFamily`]. The shard count is also recorded per parent in a
/// descriptor record; writes and reads against a parent recorded with a
/// different count fail with [`CounterError::ShardCountMismatch`].
pub struct ShardedCounter<S> {
    store: S,
    family: CounterFamily,
    strategy: WriteStrategy,
    selector: Arc<dyn ShardSelector>,
    cache: Option<(Arc<AggregateCache>, Duration)>,
    /// Bumped on every cache invalidation; a read only caches its result
    /// when no invalidation happened while it was scanning.
    cache_epoch: AtomicU64,
    metrics: Arc<CounterMetrics>,
}

impl<S: DocumentStore> ShardedCounter<S> {
    pub fn new(store: S, family: CounterFamily) -> Self {
        Self {
            store,
            family,
            strategy: WriteStrategy::Auto,
            selector: Arc::new(RandomSelector),
            cache: None,
            cache_epoch: AtomicU64::new(0),
            metrics: Arc::new(CounterMetrics::new()),
        }
    }

    /// Build a counter for family `name` from the `counters` and `cache`
    /// configuration sections.
    pub fn from_config(store: S, config: &Config, name: &str) -> CounterResult<Self> {
        let family = CounterFamily::with_collection(
            name,
            config.counters.default_shards,
            config.counters.collection.clone(),
        )?;
        let mut counter = Self::new(store, family).with_strategy(config.counters.write_strategy);
        if config.cache.aggregate_ttl_secs > 0 {
            let cache: Arc<AggregateCache> = Arc::new(Cache::<String, CounterValues>::new(
                config.cache.max_entries,
                Duration::from_secs(config.cache.aggregate_ttl_secs),
            ));
            counter = counter.with_cache(
                cache,
                Duration::from_secs(config.cache.aggregate_ttl_secs),
            );
        }
        Ok(counter)
    }

    pub fn with_strategy(mut self, strategy: WriteStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_selector(mut self, selector: Arc<dyn ShardSelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Serve reads from `cache` for up to `ttl`. Writers going through this
    /// counter invalidate the parent's entry; writers elsewhere do not.
    pub fn with_cache(mut self, cache: Arc<AggregateCache>, ttl: Duration) -> Self {
        self.cache = Some((cache, ttl));
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<CounterMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn family(&self) -> &CounterFamily {
        &self.family
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<CounterMetrics> {
        &self.metrics
    }

    /// Check the descriptor written by the initializer against this family.
    ///
    /// Returns the stored shard count, or `None` when the parent was never
    /// initialized (lazy shards only).
    pub async fn verify_layout(&self, parent: &str) -> CounterResult<Option<u32>> {
        let location = self.family.descriptor_location(parent);
        let snapshot = self.store.read(&location).await.map_err(|source| {
            warn!(
                operation = "verify_layout",
                parent = parent,
                error = %source,
                "descriptor read failed"
            );
            CounterError::LayoutReadFailed {
                parent: parent.to_string(),
                source,
            }
        })?;

        if !snapshot.exists {
            debug!(operation = "verify_layout", parent = parent, "no descriptor");
            return Ok(None);
        }

        let stored = snapshot
            .fields
            .get("shards")
            .and_then(serde_json::Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| {
                CounterError::ParseError(format!("descriptor {} has no valid shard count", location))
            })?;

        if stored != self.family.shards() {
            warn!(
                operation = "verify_layout",
                parent = parent,
                configured = self.family.shards(),
                stored = stored,
                "shard count mismatch"
            );
            return Err(CounterError::ShardCountMismatch {
                parent: parent.to_string(),
                family: self.family.name().to_string(),
                configured: self.family.shards(),
                stored,
            });
        }
        Ok(Some(stored))
    }

    /// Fail if `parent` is recorded with another shard count.
    ///
    /// With `claim` set, a parent without a descriptor gets one recording
    /// this family's shard count, so lazily written parents are protected
    /// too. Concurrent claims resolve through `CreateNew`: the loser
    /// re-checks the winner's descriptor.
    async fn ensure_layout(&self, parent: &str, claim: bool) -> CounterResult<()> {
        if self.verify_layout(parent).await?.is_some() || !claim {
            return Ok(());
        }

        let location = self.family.descriptor_location(parent);
        match self
            .store
            .write(&location, self.family.descriptor_fields(), WriteMode::CreateNew)
            .await
        {
            Ok(()) => {
                debug!(
                    operation = "claim_layout",
                    parent = parent,
                    shards = self.family.shards(),
                    "descriptor created"
                );
                Ok(())
            }
            Err(StoreError::AlreadyExists(_)) => self.verify_layout(parent).await.map(|_| ()),
            Err(source) => Err(CounterError::LayoutWriteFailed {
                parent: parent.to_string(),
                source,
            }),
        }
    }

    fn cache_key(&self, parent: &str) -> String {
        format!(
            "{}#{}/{}",
            self.family.shard_location(parent, 0).collection_path(),
            self.family.name(),
            self.family.shards()
        )
    }

    fn cache_epoch(&self) -> u64 {
        self.cache_epoch.load(Ordering::SeqCst)
    }

    async fn invalidate_cached(&self, parent: &str) {
        if let Some((cache, _)) = &self.cache {
            self.cache_epoch.fetch_add(1, Ordering::SeqCst);
            cache.invalidate(&self.cache_key(parent)).await;
        }
    }
}

pub(crate) fn validate_field(field: &str) -> CounterResult<()> {
    if field.is_empty() {
        return Err(CounterError::InvalidArgument(
            "counter field name must not be empty".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Fields, MemoryStore};
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn test_selectors_stay_in_range() {
        let random = RandomSelector;
        for _ in 0..1000 {
            assert!(random.pick(7) < 7);
        }

        let rr = RoundRobinSelector::default();
        let picks: Vec<u32> = (0..6).map(|_| rr.pick(4)).collect();
        assert_eq!(picks, vec![0, 1, 2, 3, 0, 1]);

        assert_eq!(FixedSelector(2).pick(10), 2);
    }

    #[test]
    fn test_random_selector_reaches_every_shard() {
        let mut seen = [false; 5];
        for _ in 0..1000 {
            seen[RandomSelector.pick(5) as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_write_strategy_parsing() {
        assert_eq!(WriteStrategy::from_str("auto").unwrap(), WriteStrategy::Auto);
        assert_eq!(
            WriteStrategy::from_str("read_then_write").unwrap(),
            WriteStrategy::ReadThenWrite
        );
        assert!(WriteStrategy::from_str("sometimes").is_err());
        assert_eq!(WriteStrategy::Upsert.to_string(), "upsert");
    }

    #[tokio::test]
    async fn test_from_config_uses_sections() {
        let mut config = Config::default();
        config.counters.default_shards = 4;
        config.counters.collection = "like_shards".to_string();
        config.counters.write_strategy = WriteStrategy::ReadThenWrite;
        config.cache.aggregate_ttl_secs = 60;

        let counter = ShardedCounter::from_config(MemoryStore::new(), &config, "likes").unwrap();
        assert_eq!(counter.family().shards(), 4);
        assert_eq!(counter.family().collection(), "like_shards");
        assert_eq!(counter.strategy, WriteStrategy::ReadThenWrite);
        assert!(counter.cache.is_some());
    }

    #[tokio::test]
    async fn test_verify_layout() {
        let store = Arc::new(MemoryStore::new());
        let five = ShardedCounter::new(Arc::clone(&store), CounterFamily::new("likes", 5).unwrap());

        assert_eq!(five.verify_layout("posts/p1").await.unwrap(), None);

        five.initialize_counters("posts/p1", &["likes"]).await.unwrap();
        assert_eq!(five.verify_layout("posts/p1").await.unwrap(), Some(5));

        let ten = ShardedCounter::new(Arc::clone(&store), CounterFamily::new("likes", 10).unwrap());
        match ten.verify_layout("posts/p1").await {
            Err(CounterError::ShardCountMismatch {
                configured, stored, ..
            }) => {
                assert_eq!(configured, 10);
                assert_eq!(stored, 5);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_verify_layout_rejects_corrupt_descriptor() {
        let store = Arc::new(MemoryStore::new());
        let counter = ShardedCounter::new(Arc::clone(&store), CounterFamily::new("likes", 5).unwrap());
        let mut fields = Fields::new();
        fields.insert("shards".to_string(), json!("five"));
        store.put("posts/p1/counter_families/likes", fields).await;

        assert!(matches!(
            counter.verify_layout("posts/p1").await,
            Err(CounterError::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_first_lazy_write_claims_layout() {
        let store = Arc::new(MemoryStore::new());
        let five = ShardedCounter::new(Arc::clone(&store), CounterFamily::new("likes", 5).unwrap());
        five.increment("posts/p1", "likes").await.unwrap();

        assert_eq!(five.verify_layout("posts/p1").await.unwrap(), Some(5));

        let ten = ShardedCounter::new(Arc::clone(&store), CounterFamily::new("likes", 10).unwrap());
        assert!(matches!(
            ten.increment("posts/p1", "likes").await,
            Err(CounterError::ShardCountMismatch { stored: 5, .. })
        ));
        assert!(matches!(
            ten.get_counter_value("posts/p1", "likes").await,
            Err(CounterError::ShardCountMismatch { configured: 10, .. })
        ));
        assert_eq!(five.get_counter_value("posts/p1", "likes").await.unwrap(), 1);
    }

    #[test]
    fn test_cache_key_includes_family_layout() {
        let store = Arc::new(MemoryStore::new());
        let five = ShardedCounter::new(Arc::clone(&store), CounterFamily::new("likes", 5).unwrap());
        let ten = ShardedCounter::new(Arc::clone(&store), CounterFamily::new("likes", 10).unwrap());
        let plays = ShardedCounter::new(Arc::clone(&store), CounterFamily::new("plays", 5).unwrap());

        assert_eq!(five.cache_key("posts/p1"), "posts/p1/shards#likes/5");
        assert_ne!(five.cache_key("posts/p1"), ten.cache_key("posts/p1"));
        assert_ne!(five.cache_key("posts/p1"), plays.cache_key("posts/p1"));
    }

    #[test]
    fn test_validate_field() {
        assert!(validate_field("likes").is_ok());
        assert!(matches!(
            validate_field(""),
            Err(CounterError::InvalidArgument(_))
        ));
    }
}
