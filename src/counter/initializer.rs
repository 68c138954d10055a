use super::{validate_field, ShardedCounter};
use crate::error::{CounterError, CounterResult};
use crate::store::{DocumentStore, Fields, WriteBatch};
use serde_json::Value;
use tracing::{debug, error, instrument};

impl<S: DocumentStore> ShardedCounter<S> {
    /// Create all `N` shards of `parent` with every field in `fields` at 0,
    /// plus the family descriptor, in one atomic batch.
    ///
    /// An empty `fields` list is a successful no-op. Calling this again
    /// resets every shard to 0 and erases earlier increments.
    #[instrument(skip(self, fields), fields(family = %self.family.name()))]
    pub async fn initialize_counters<F>(&self, parent: &str, fields: &[F]) -> CounterResult<()>
    where
        F: AsRef<str> + Sync,
    {
        if fields.is_empty() {
            debug!(operation = "initialize", parent = parent, "no fields, nothing to do");
            return Ok(());
        }

        let mut zeroed = Fields::new();
        for field in fields {
            let field = field.as_ref();
            validate_field(field)?;
            zeroed.insert(field.to_string(), Value::from(0));
        }

        let mut batch = WriteBatch::new();
        for location in self.family.shard_locations(parent) {
            batch.set(location, zeroed.clone());
        }
        batch.set(
            self.family.descriptor_location(parent),
            self.family.descriptor_fields(),
        );

        let writes = batch.len();
        if let Err(source) = self.store.commit(batch).await {
            error!(
                operation = "initialize",
                parent = parent,
                writes = writes,
                error = %source,
                "batch commit failed"
            );
            self.metrics.record_failure("initialize");
            return Err(CounterError::BatchWriteFailed {
                parent: parent.to_string(),
                source,
            });
        }

        self.invalidate_cached(parent).await;
        self.metrics.record_initialization();
        debug!(
            operation = "initialize",
            parent = parent,
            shards = self.family.shards(),
            fields = zeroed.len(),
            "counters initialized"
        );
        Ok(())
    }
}
