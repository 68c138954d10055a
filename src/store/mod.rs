//! Document store capability consumed by the counters, search and feed.
//!
//! Backends implement [`DocumentStore`]. [`MemoryStore`] is the in-process
//! implementation used by the CLI and the tests; [`RetryingStore`] wraps
//! any store with read retries and a circuit breaker.

pub mod circuit_breaker;
pub mod memory;
pub mod query;
pub mod retry;

use crate::error::StoreResult;
use crate::layout::ShardLocation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use memory::MemoryStore;
pub use query::{compare_values, Direction, Filter, Query, MAX_IN_VALUES};
pub use retry::RetryingStore;

/// Field mapping of a record.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Result of a point read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub exists: bool,
    pub fields: Fields,
}

impl Snapshot {
    pub fn missing() -> Self {
        Self::default()
    }

    pub fn found(fields: Fields) -> Self {
        Self {
            exists: true,
            fields,
        }
    }
}

/// A record returned by a collection listing or query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Last path segment of the record
    pub id: String,
    /// Full path of the record
    pub path: String,
    pub fields: Fields,
}

/// How [`DocumentStore::write`] treats an existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum WriteMode {
    /// Create the record or replace all of its fields
    Overwrite,
    /// Create the record or replace only the given top-level fields
    Merge,
    /// Create the record; fail with `AlreadyExists` if it is present
    CreateNew,
}

/// Store operations, used for logging, fault injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum StoreOp {
    Read,
    Write,
    IncrementField,
    UpsertIncrement,
    Commit,
    ListChildren,
    Query,
}

impl StoreOp {
    /// Whether repeating the operation cannot change stored state.
    pub fn is_idempotent(self) -> bool {
        matches!(self, StoreOp::Read | StoreOp::ListChildren | StoreOp::Query)
    }
}

/// Writes applied together by [`DocumentStore::commit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    writes: Vec<(ShardLocation, Fields)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a create-or-overwrite of `location` with `fields`.
    pub fn set(&mut self, location: ShardLocation, fields: Fields) -> &mut Self {
        self.writes.push((location, fields));
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ShardLocation, Fields)> {
        self.writes.iter()
    }

    pub fn into_writes(self) -> Vec<(ShardLocation, Fields)> {
        self.writes
    }
}

/// Capability interface of a document store backend.
///
/// `increment_field` and `upsert_increment` must be server-side atomic adds;
/// `commit` must apply the whole batch or nothing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point read of one record.
    async fn read(&self, location: &ShardLocation) -> StoreResult<Snapshot>;

    /// Write `fields` to `location` according to `mode`.
    async fn write(&self, location: &ShardLocation, fields: Fields, mode: WriteMode)
        -> StoreResult<()>;

    /// Atomically add `delta` to `field` of an existing record.
    ///
    /// Fails with `NotFound` if the record does not exist. A missing or
    /// non-integer field is treated as 0.
    async fn increment_field(
        &self,
        location: &ShardLocation,
        field: &str,
        delta: i64,
    ) -> StoreResult<()>;

    /// Whether [`upsert_increment`](Self::upsert_increment) is available.
    fn supports_upsert_increment(&self) -> bool {
        false
    }

    /// Create `{field: delta}` if the record is absent, otherwise atomically
    /// add `delta` to `field`, as one server-side operation.
    async fn upsert_increment(
        &self,
        location: &ShardLocation,
        field: &str,
        delta: i64,
    ) -> StoreResult<()> {
        let _ = (field, delta);
        Err(crate::error::StoreError::Unsupported(format!(
            "upsert_increment on {}",
            location
        )))
    }

    /// Apply every write of `batch` atomically.
    async fn commit(&self, batch: WriteBatch) -> StoreResult<()>;

    /// Every record directly under `parent/collection`, in no particular order.
    async fn list_children(&self, parent: &str, collection: &str) -> StoreResult<Vec<Document>>;

    /// Run a filtered, ordered, limited query over one collection.
    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>>;
}

#[async_trait]
impl<S: DocumentStore + ?Sized> DocumentStore for std::sync::Arc<S> {
    async fn read(&self, location: &ShardLocation) -> StoreResult<Snapshot> {
        (**self).read(location).await
    }

    async fn write(
        &self,
        location: &ShardLocation,
        fields: Fields,
        mode: WriteMode,
    ) -> StoreResult<()> {
        (**self).write(location, fields, mode).await
    }

    async fn increment_field(
        &self,
        location: &ShardLocation,
        field: &str,
        delta: i64,
    ) -> StoreResult<()> {
        (**self).increment_field(location, field, delta).await
    }

    fn supports_upsert_increment(&self) -> bool {
        (**self).supports_upsert_increment()
    }

    async fn upsert_increment(
        &self,
        location: &ShardLocation,
        field: &str,
        delta: i64,
    ) -> StoreResult<()> {
        (**self).upsert_increment(location, field, delta).await
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        (**self).commit(batch).await
    }

    async fn list_children(&self, parent: &str, collection: &str) -> StoreResult<Vec<Document>> {
        (**self).list_children(parent, collection).await
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
        (**self).query(query).await
    }
}
