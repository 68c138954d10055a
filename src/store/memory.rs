use super::query::compare_values;
use super::{Document, DocumentStore, Fields, Query, Snapshot, StoreOp, WriteBatch, WriteMode};
use crate::error::{CounterError, StoreError, StoreResult};
use crate::layout::ShardLocation;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// In-process document store.
///
/// Records live in one ordered map behind a single lock, which makes every
/// operation (including batch commits) atomic. Useful as a reference backend,
/// for the CLI and in tests, where failures can be injected per operation.
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, Fields>>,
    upsert_enabled: bool,
    faults: Mutex<HashMap<StoreOp, VecDeque<StoreError>>>,
    calls: Mutex<HashMap<StoreOp, u64>>,
}

impl MemoryStore {
    /// Create an empty store that supports the atomic upsert primitive.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            upsert_enabled: true,
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Create an empty store without `upsert_increment`, like backends whose
    /// only conditional primitive is create-if-absent.
    pub fn without_upsert() -> Self {
        Self {
            upsert_enabled: false,
            ..Self::new()
        }
    }

    /// Make the next call of `op` fail with `error`. Faults queue up in order.
    pub fn inject_fault(&self, op: StoreOp, error: StoreError) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.entry(op).or_default().push_back(error);
        }
    }

    /// Number of calls of `op` made so far, including failed ones.
    pub fn call_count(&self, op: StoreOp) -> u64 {
        self.calls
            .lock()
            .map(|calls| calls.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Fields of the record at `path`, if present.
    pub async fn get(&self, path: &str) -> Option<Fields> {
        self.records.read().await.get(path).cloned()
    }

    /// Insert or replace a record directly, bypassing call accounting.
    pub async fn put(&self, path: &str, fields: Fields) {
        self.records
            .write()
            .await
            .insert(path.trim_matches('/').to_string(), fields);
    }

    /// Number of records held.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Load a store from a JSON snapshot written by [`save_snapshot`](Self::save_snapshot).
    /// A missing file yields an empty store.
    pub async fn load_snapshot(path: &Path) -> Result<Self, CounterError> {
        let store = Self::new();
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let records: BTreeMap<String, Fields> = serde_json::from_str(&content)?;
                debug!(
                    operation = "load_snapshot",
                    path = %path.display(),
                    records = records.len()
                );
                *store.records.write().await = records;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(operation = "load_snapshot", path = %path.display(), "no snapshot yet");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(store)
    }

    /// Write every record as one JSON object keyed by path.
    pub async fn save_snapshot(&self, path: &Path) -> Result<(), CounterError> {
        let content = {
            let records = self.records.read().await;
            serde_json::to_string_pretty(&*records)?
        };
        tokio::fs::write(path, content).await?;
        debug!(operation = "save_snapshot", path = %path.display());
        Ok(())
    }

    fn begin(&self, op: StoreOp) -> StoreResult<()> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(op).or_insert(0) += 1;
        }
        let fault = self
            .faults
            .lock()
            .ok()
            .and_then(|mut faults| faults.get_mut(&op).and_then(VecDeque::pop_front));
        match fault {
            Some(err) => {
                trace!(store_op = %op, error = %err, "injected fault");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn document(path: &str, fields: &Fields) -> Document {
        let id = path.rsplit('/').next().unwrap_or(path).to_string();
        Document {
            id,
            path: path.to_string(),
            fields: fields.clone(),
        }
    }

    fn children<'a>(
        records: &'a BTreeMap<String, Fields>,
        collection_path: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Fields)> + 'a {
        let prefix = format!("{}/", collection_path.trim_matches('/'));
        records
            .range(prefix.clone()..)
            .take_while(move |(path, _)| path.starts_with(&prefix))
            .filter(move |(path, _)| {
                // direct children only, not nested sub-collections
                !path[collection_path.trim_matches('/').len() + 1..].contains('/')
            })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn add_to_field(fields: &mut Fields, field: &str, delta: i64) {
    let current = fields.get(field).and_then(Value::as_i64).unwrap_or(0);
    fields.insert(field.to_string(), Value::from(current.saturating_add(delta)));
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn read(&self, location: &ShardLocation) -> StoreResult<Snapshot> {
        self.begin(StoreOp::Read)?;
        let records = self.records.read().await;
        Ok(match records.get(&location.path()) {
            Some(fields) => Snapshot::found(fields.clone()),
            None => Snapshot::missing(),
        })
    }

    async fn write(
        &self,
        location: &ShardLocation,
        fields: Fields,
        mode: WriteMode,
    ) -> StoreResult<()> {
        self.begin(StoreOp::Write)?;
        let path = location.path();
        let mut records = self.records.write().await;
        match mode {
            WriteMode::Overwrite => {
                records.insert(path, fields);
            }
            WriteMode::Merge => {
                records.entry(path).or_default().extend(fields);
            }
            WriteMode::CreateNew => {
                if records.contains_key(&path) {
                    return Err(StoreError::AlreadyExists(path));
                }
                records.insert(path, fields);
            }
        }
        Ok(())
    }

    async fn increment_field(
        &self,
        location: &ShardLocation,
        field: &str,
        delta: i64,
    ) -> StoreResult<()> {
        self.begin(StoreOp::IncrementField)?;
        let path = location.path();
        let mut records = self.records.write().await;
        let fields = records
            .get_mut(&path)
            .ok_or_else(|| StoreError::NotFound(path.clone()))?;
        add_to_field(fields, field, delta);
        Ok(())
    }

    fn supports_upsert_increment(&self) -> bool {
        self.upsert_enabled
    }

    async fn upsert_increment(
        &self,
        location: &ShardLocation,
        field: &str,
        delta: i64,
    ) -> StoreResult<()> {
        self.begin(StoreOp::UpsertIncrement)?;
        if !self.upsert_enabled {
            return Err(StoreError::Unsupported(format!(
                "upsert_increment on {}",
                location
            )));
        }
        let mut records = self.records.write().await;
        add_to_field(records.entry(location.path()).or_default(), field, delta);
        Ok(())
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        self.begin(StoreOp::Commit)?;
        let mut records = self.records.write().await;
        for (location, fields) in batch.into_writes() {
            records.insert(location.path(), fields);
        }
        Ok(())
    }

    async fn list_children(&self, parent: &str, collection: &str) -> StoreResult<Vec<Document>> {
        self.begin(StoreOp::ListChildren)?;
        let collection_path = format!("{}/{}", parent.trim_matches('/'), collection);
        let records = self.records.read().await;
        Ok(Self::children(&records, &collection_path)
            .map(|(path, fields)| Self::document(path, fields))
            .collect())
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
        self.begin(StoreOp::Query)?;
        query.validate()?;

        let records = self.records.read().await;
        let mut docs: Vec<Document> = Self::children(&records, &query.collection)
            .filter(|(_, fields)| query.filters.iter().all(|f| f.matches(fields)))
            .map(|(path, fields)| Self::document(path, fields))
            .collect();
        drop(records);

        if let Some((field, direction)) = &query.order_by {
            // records without the order field are excluded, as in most document stores
            docs.retain(|d| d.fields.contains_key(field));
            docs.sort_by(|a, b| {
                let ord = compare_values(&a.fields[field], &b.fields[field]);
                match direction {
                    super::Direction::Ascending => ord,
                    super::Direction::Descending => ord.reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }
}
