use super::{CounterValues, ShardedCounter};
use crate::error::{CounterError, CounterResult};
use crate::layout::ShardLocation;
use crate::store::{Document, DocumentStore};
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, error, instrument, warn};

/// Integer counter contribution of a field value; anything else is foreign.
fn counter_value(value: &Value) -> Option<i64> {
    value.as_i64()
}

/// Sum `field` across `shards`; shards without it contribute 0.
pub(crate) fn sum_field(shards: &[Document], field: &str) -> i64 {
    shards
        .iter()
        .filter_map(|doc| doc.fields.get(field).and_then(counter_value))
        .fold(0i64, i64::saturating_add)
}

/// Sum every integer-valued field across `shards`. Keys whose values are
/// never integers (strings, objects, arrays, floats, ...) are left out.
pub(crate) fn sum_all(shards: &[Document]) -> CounterValues {
    let mut totals = CounterValues::new();
    for doc in shards {
        for (field, value) in &doc.fields {
            if let Some(n) = counter_value(value) {
                let total = totals.entry(field.clone()).or_insert(0);
                *total = total.saturating_add(n);
            }
        }
    }
    totals
}

impl<S: DocumentStore> ShardedCounter<S> {
    /// Current value of `field` for `parent`: the sum over all of its shards.
    ///
    /// Returns 0 when no shard exists or none holds `field`. A store failure
    /// is an error, never a silent 0.
    #[instrument(skip(self), fields(family = %self.family.name()))]
    pub async fn get_counter_value(&self, parent: &str, field: &str) -> CounterResult<i64> {
        if self.cache.is_some() {
            let values = self.get_all_counter_values(parent).await?;
            return Ok(values.get(field).copied().unwrap_or(0));
        }

        let start = Instant::now();
        let shards = self.scan_shards(parent).await?;
        let value = sum_field(&shards, field);
        self.metrics.record_aggregate_read(start.elapsed());
        debug!(
            operation = "get_counter_value",
            parent = parent,
            field = field,
            shards = shards.len(),
            value = value
        );
        Ok(value)
    }

    /// Current value of every counter field of `parent`.
    #[instrument(skip(self), fields(family = %self.family.name()))]
    pub async fn get_all_counter_values(&self, parent: &str) -> CounterResult<CounterValues> {
        let key = self.cache_key(parent);
        if let Some((cache, _)) = &self.cache {
            if let Some(values) = cache.get(&key).await {
                self.metrics.record_cache_hit();
                return Ok(values);
            }
            self.metrics.record_cache_miss();
        }

        let epoch = self.cache_epoch();
        let start = Instant::now();
        let shards = self.scan_shards(parent).await?;
        let values = sum_all(&shards);
        self.metrics.record_aggregate_read(start.elapsed());
        debug!(
            operation = "get_all_counter_values",
            parent = parent,
            shards = shards.len(),
            fields = values.len()
        );

        if let Some((cache, ttl)) = &self.cache {
            // a write landing during the scan may not be in `values`
            if self.cache_epoch() == epoch {
                cache.set(key.clone(), values.clone(), *ttl).await;
                if self.cache_epoch() != epoch {
                    cache.invalidate(&key).await;
                }
            }
        }
        Ok(values)
    }

    /// Every shard record of `parent` whose id is an index in `[0, N)`.
    ///
    /// Fails with `ShardCountMismatch` when the parent is recorded with a
    /// different shard count, since summing `[0, N)` would then be wrong.
    async fn scan_shards(&self, parent: &str) -> CounterResult<Vec<Document>> {
        let docs = self
            .store
            .list_children(parent, self.family.collection())
            .await
            .map_err(|source| {
                error!(
                    operation = "scan_shards",
                    parent = parent,
                    error = %source,
                    "shard query failed"
                );
                self.metrics.record_failure("aggregate");
                CounterError::AggregationQueryFailed {
                    parent: parent.to_string(),
                    source,
                }
            })?;
        self.ensure_layout(parent, false).await?;

        let shards = self.family.shards();
        let (in_range, stray): (Vec<Document>, Vec<Document>) = docs
            .into_iter()
            .partition(|doc| ShardLocation::index_from_id(&doc.id, shards).is_some());
        if !stray.is_empty() {
            // written under a different shard count, or not a shard at all
            warn!(
                operation = "scan_shards",
                parent = parent,
                shards = shards,
                ignored = ?stray.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
                "ignoring records outside the shard range"
            );
        }
        Ok(in_range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::counter::AggregateCache;
    use crate::error::StoreError;
    use crate::layout::CounterFamily;
    use crate::layout::ShardLocation;
    use crate::store::{
        Fields, MemoryStore, MockDocumentStore, Query, Snapshot, StoreOp, WriteBatch, WriteMode,
    };
    use crate::error::StoreResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn doc(id: &str, fields: Value) -> Document {
        Document {
            id: id.to_string(),
            path: format!("posts/p1/shards/{}", id),
            fields: fields.as_object().cloned().unwrap(),
        }
    }

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    async fn seeded(shards: &[Value]) -> (Arc<MemoryStore>, ShardedCounter<Arc<MemoryStore>>) {
        let store = Arc::new(MemoryStore::new());
        for (i, shard) in shards.iter().enumerate() {
            store
                .put(&format!("posts/p1/shards/{}", i), fields(shard.clone()))
                .await;
        }
        let counter = ShardedCounter::new(Arc::clone(&store), CounterFamily::default());
        (store, counter)
    }

    #[test]
    fn test_sum_field_treats_missing_as_zero() {
        let shards = vec![
            doc("0", json!({"likes": 3})),
            doc("1", json!({"views": 9})),
            doc("2", json!({"likes": "many"})),
            doc("3", json!({"likes": -1})),
        ];
        assert_eq!(sum_field(&shards, "likes"), 2);
        assert_eq!(sum_field(&shards, "shares"), 0);
        assert_eq!(sum_field(&[], "likes"), 0);
    }

    #[test]
    fn test_sum_all_ignores_non_integer_fields() {
        let shards = vec![
            doc("0", json!({"likes": 3, "name": "John", "ratio": 0.5})),
            doc("1", json!({"likes": 5, "metadata": {"a": 1}, "tags": [1, 2], "ok": true})),
        ];
        let values = sum_all(&shards);
        assert_eq!(values.len(), 1);
        assert_eq!(values["likes"], 8);
    }

    #[test]
    fn test_sum_all_keeps_key_numeric_in_some_shard() {
        let shards = vec![
            doc("0", json!({"plays": "n/a"})),
            doc("1", json!({"plays": 4})),
        ];
        assert_eq!(sum_all(&shards)["plays"], 4);
    }

    #[test]
    fn test_sums_saturate() {
        let shards = vec![
            doc("0", json!({"likes": i64::MAX})),
            doc("1", json!({"likes": 10})),
        ];
        assert_eq!(sum_field(&shards, "likes"), i64::MAX);
        assert_eq!(sum_all(&shards)["likes"], i64::MAX);
    }

    #[tokio::test]
    async fn test_get_counter_value_sums_shards() {
        let (_, counter) = seeded(&[json!({"likes": 3}), json!({"likes": 5}), json!({"likes": 2})]).await;
        assert_eq!(counter.get_counter_value("posts/p1", "likes").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_get_all_counter_values_mixed_fields() {
        let (_, counter) = seeded(&[
            json!({"likes": 3, "name": "John"}),
            json!({"likes": 5, "metadata": {"a": 1}}),
        ])
        .await;
        let values = counter.get_all_counter_values("posts/p1").await.unwrap();
        assert_eq!(values, CounterValues::from([("likes".to_string(), 8)]));
    }

    #[tokio::test]
    async fn test_zero_shards_reads_zero() {
        let (_, counter) = seeded(&[]).await;
        assert_eq!(counter.get_counter_value("posts/p1", "likes").await.unwrap(), 0);
        assert!(counter
            .get_all_counter_values("posts/p1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_reader_is_idempotent() {
        let (_, counter) = seeded(&[json!({"likes": 3}), json!({"views": 1})]).await;
        let first = counter.get_counter_value("posts/p1", "likes").await.unwrap();
        let second = counter.get_counter_value("posts/p1", "likes").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_shards_outside_range_are_ignored() {
        let store = Arc::new(MemoryStore::new());
        store.put("posts/p1/shards/0", fields(json!({"likes": 1}))).await;
        store.put("posts/p1/shards/4", fields(json!({"likes": 10}))).await;
        store.put("posts/p1/shards/notes", fields(json!({"likes": 100}))).await;

        let counter = ShardedCounter::new(Arc::clone(&store), CounterFamily::new("post", 4).unwrap());
        assert_eq!(counter.get_counter_value("posts/p1", "likes").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_query_failure_is_an_error_not_zero() {
        let mut store = MockDocumentStore::new();
        store
            .expect_list_children()
            .times(1)
            .withf(|parent, collection| parent == "posts/p1" && collection == "shards")
            .returning(|_, _| Err(StoreError::TimedOut("scan".to_string())));

        let counter = ShardedCounter::new(store, CounterFamily::default());
        match counter.get_counter_value("posts/p1", "likes").await {
            Err(CounterError::AggregationQueryFailed { parent, source }) => {
                assert_eq!(parent, "posts/p1");
                assert_eq!(source, StoreError::TimedOut("scan".to_string()));
            }
            other => panic!("expected AggregationQueryFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cached_reads_skip_the_store_until_a_write() {
        let (store, counter) = seeded(&[json!({"likes": 3})]).await;
        let cache: Arc<AggregateCache> =
            Arc::new(Cache::<String, CounterValues>::new(100, Duration::from_secs(60)));
        let counter = counter.with_cache(cache, Duration::from_secs(60));

        assert_eq!(counter.get_counter_value("posts/p1", "likes").await.unwrap(), 3);
        assert_eq!(counter.get_counter_value("posts/p1", "likes").await.unwrap(), 3);
        assert_eq!(store.call_count(StoreOp::ListChildren), 1);

        // a write through the counter invalidates the cached aggregate
        counter.increment("posts/p1", "likes").await.unwrap();
        assert_eq!(counter.get_counter_value("posts/p1", "likes").await.unwrap(), 4);
        assert_eq!(store.call_count(StoreOp::ListChildren), 2);

        let s = counter.metrics().snapshot();
        assert_eq!(s.cache_hits, 1);
        assert_eq!(s.cache_misses, 2);
    }

    #[tokio::test]
    async fn test_cache_entries_expire() {
        let (store, counter) = seeded(&[json!({"likes": 3})]).await;
        let cache: Arc<AggregateCache> =
            Arc::new(Cache::<String, CounterValues>::new(100, Duration::from_secs(60)));
        let counter = counter.with_cache(cache, Duration::from_millis(50));

        counter.get_counter_value("posts/p1", "likes").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        counter.get_counter_value("posts/p1", "likes").await.unwrap();
        assert_eq!(store.call_count(StoreOp::ListChildren), 2);
    }

    #[tokio::test]
    async fn test_read_with_other_shard_count_fails() {
        let store = Arc::new(MemoryStore::new());
        let ten = ShardedCounter::new(Arc::clone(&store), CounterFamily::new("post", 10).unwrap());
        ten.initialize_counters("posts/p1", &["likes"]).await.unwrap();
        for _ in 0..40 {
            ten.increment("posts/p1", "likes").await.unwrap();
        }

        let five = ShardedCounter::new(Arc::clone(&store), CounterFamily::new("post", 5).unwrap());
        match five.get_counter_value("posts/p1", "likes").await {
            Err(CounterError::ShardCountMismatch {
                configured, stored, ..
            }) => {
                assert_eq!(configured, 5);
                assert_eq!(stored, 10);
            }
            other => panic!("expected ShardCountMismatch, got {:?}", other),
        }
        assert!(five.get_all_counter_values("posts/p1").await.is_err());
        assert_eq!(ten.get_counter_value("posts/p1", "likes").await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_families_sharing_a_cache_do_not_mix() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..10 {
            store
                .put(&format!("posts/p1/shards/{}", i), fields(json!({"likes": 1})))
                .await;
        }
        let cache: Arc<AggregateCache> =
            Arc::new(Cache::<String, CounterValues>::new(100, Duration::from_secs(60)));
        let ten = ShardedCounter::new(Arc::clone(&store), CounterFamily::new("post", 10).unwrap())
            .with_cache(Arc::clone(&cache), Duration::from_secs(60));
        let five = ShardedCounter::new(Arc::clone(&store), CounterFamily::new("views", 5).unwrap())
            .with_cache(Arc::clone(&cache), Duration::from_secs(60));

        assert_eq!(ten.get_counter_value("posts/p1", "likes").await.unwrap(), 10);
        assert_eq!(five.get_counter_value("posts/p1", "likes").await.unwrap(), 5);
    }

    /// Lists shards from the inner store, then holds the result until the
    /// gate opens, so a write can land between the scan and the cache fill.
    struct GatedStore {
        inner: Arc<MemoryStore>,
        armed: AtomicBool,
        scanned: Notify,
        gate: Notify,
    }

    #[async_trait]
    impl DocumentStore for GatedStore {
        async fn read(&self, location: &ShardLocation) -> StoreResult<Snapshot> {
            self.inner.read(location).await
        }
        async fn write(
            &self,
            location: &ShardLocation,
            fields: Fields,
            mode: WriteMode,
        ) -> StoreResult<()> {
            self.inner.write(location, fields, mode).await
        }
        async fn increment_field(
            &self,
            location: &ShardLocation,
            field: &str,
            delta: i64,
        ) -> StoreResult<()> {
            self.inner.increment_field(location, field, delta).await
        }
        fn supports_upsert_increment(&self) -> bool {
            self.inner.supports_upsert_increment()
        }
        async fn upsert_increment(
            &self,
            location: &ShardLocation,
            field: &str,
            delta: i64,
        ) -> StoreResult<()> {
            self.inner.upsert_increment(location, field, delta).await
        }
        async fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
            self.inner.commit(batch).await
        }
        async fn list_children(&self, parent: &str, collection: &str) -> StoreResult<Vec<Document>> {
            let docs = self.inner.list_children(parent, collection).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.scanned.notify_one();
                self.gate.notified().await;
            }
            Ok(docs)
        }
        async fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
            self.inner.query(query).await
        }
    }

    #[tokio::test]
    async fn test_write_during_scan_is_not_hidden_by_cache() {
        let inner = Arc::new(MemoryStore::new());
        let store = Arc::new(GatedStore {
            inner: Arc::clone(&inner),
            armed: AtomicBool::new(true),
            scanned: Notify::new(),
            gate: Notify::new(),
        });
        let cache: Arc<AggregateCache> =
            Arc::new(Cache::<String, CounterValues>::new(100, Duration::from_secs(60)));
        let counter = ShardedCounter::new(Arc::clone(&store), CounterFamily::default())
            .with_cache(cache, Duration::from_secs(60));

        let (during, ()) = tokio::join!(counter.get_counter_value("posts/p1", "likes"), async {
            store.scanned.notified().await;
            counter.increment("posts/p1", "likes").await.unwrap();
            store.gate.notify_one();
        });
        // the in-flight read started before the write
        assert_eq!(during.unwrap(), 0);

        assert_eq!(counter.get_counter_value("posts/p1", "likes").await.unwrap(), 1);
        assert_eq!(inner.call_count(StoreOp::ListChildren), 2);
    }
}
