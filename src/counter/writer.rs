use super::{validate_field, ShardedCounter, WriteStrategy};
use crate::error::{CounterError, CounterResult, StoreError};
use crate::layout::ShardLocation;
use crate::store::{DocumentStore, Fields, WriteMode};
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, error, instrument};

impl<S: DocumentStore> ShardedCounter<S> {
    /// Add 1 to `field` of `parent`.
    pub async fn increment(&self, parent: &str, field: &str) -> CounterResult<()> {
        self.increment_by(parent, field, 1).await
    }

    /// Add `delta` (which may be negative) to `field` of `parent` on one
    /// randomly chosen shard, creating the shard if needed.
    ///
    /// The first write to a parent records the family's shard count; a
    /// parent recorded with another count is rejected before any shard is
    /// touched.
    ///
    /// Not safe to retry blindly: if the store applied the write but the
    /// acknowledgment was lost, a retry applies `delta` twice.
    #[instrument(skip(self), fields(family = %self.family.name()))]
    pub async fn increment_by(&self, parent: &str, field: &str, delta: i64) -> CounterResult<()> {
        validate_field(field)?;

        let start = Instant::now();
        let shard = self.selector.pick(self.family.shards()) % self.family.shards();
        let location = self.family.shard_location(parent, shard);

        let result = match self.ensure_layout(parent, true).await {
            Err(e) => Err(e),
            Ok(()) => match self.effective_strategy() {
                WriteStrategy::Upsert => self.upsert(parent, shard, &location, field, delta).await,
                _ => {
                    self.read_then_write(parent, shard, &location, field, delta)
                        .await
                }
            },
        };

        match result {
            Ok(()) => {
                self.invalidate_cached(parent).await;
                self.metrics.record_increment(start.elapsed());
                debug!(
                    operation = "increment",
                    parent = parent,
                    field = field,
                    shard = shard,
                    delta = delta
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    operation = "increment",
                    parent = parent,
                    field = field,
                    shard = shard,
                    error = %e,
                    "increment failed"
                );
                self.metrics.record_failure("increment");
                Err(e)
            }
        }
    }

    fn effective_strategy(&self) -> WriteStrategy {
        match self.strategy {
            WriteStrategy::Auto if self.store.supports_upsert_increment() => WriteStrategy::Upsert,
            WriteStrategy::Auto => WriteStrategy::ReadThenWrite,
            other => other,
        }
    }

    async fn upsert(
        &self,
        parent: &str,
        shard: u32,
        location: &ShardLocation,
        field: &str,
        delta: i64,
    ) -> CounterResult<()> {
        self.store
            .upsert_increment(location, field, delta)
            .await
            .map_err(|source| write_failed(parent, shard, source))?;
        self.metrics.record_upsert();
        Ok(())
    }

    async fn read_then_write(
        &self,
        parent: &str,
        shard: u32,
        location: &ShardLocation,
        field: &str,
        delta: i64,
    ) -> CounterResult<()> {
        let snapshot =
            self.store
                .read(location)
                .await
                .map_err(|source| CounterError::ShardReadFailed {
                    parent: parent.to_string(),
                    shard,
                    source,
                })?;

        if !snapshot.exists {
            let mut fields = Fields::new();
            fields.insert(field.to_string(), Value::from(delta));
            match self.store.write(location, fields, WriteMode::CreateNew).await {
                Ok(()) => {
                    self.metrics.record_lazy_create();
                    return Ok(());
                }
                // another writer created the shard since our read
                Err(StoreError::AlreadyExists(_)) => {
                    self.metrics.record_create_race();
                    debug!(
                        operation = "increment",
                        parent = parent,
                        shard = shard,
                        "shard created concurrently, incrementing instead"
                    );
                }
                Err(source) => return Err(write_failed(parent, shard, source)),
            }
        }

        self.store
            .increment_field(location, field, delta)
            .await
            .map_err(|source| write_failed(parent, shard, source))
    }
}

fn write_failed(parent: &str, shard: u32, source: StoreError) -> CounterError {
    CounterError::ShardWriteFailed {
        parent: parent.to_string(),
        shard,
        source,
    }
}
