//! Shared helpers for the integration tests.

#![allow(dead_code)]

use loop_counters::store::Fields;
use loop_counters::{CounterFamily, DocumentStore, MemoryStore, ShardedCounter};
use serde_json::Value;
use std::sync::Arc;

pub type MemoryCounter = ShardedCounter<Arc<MemoryStore>>;

/// A fresh store and a counter family `name` with `shards` shards over it.
pub fn counter_with_shards(name: &str, shards: u32) -> (Arc<MemoryStore>, MemoryCounter) {
    let store = Arc::new(MemoryStore::new());
    let family = CounterFamily::new(name, shards).unwrap();
    let counter = ShardedCounter::new(Arc::clone(&store), family);
    (store, counter)
}

pub fn fields(value: Value) -> Fields {
    value.as_object().cloned().unwrap()
}

/// Shard records currently stored under `parent`, as `(id, fields)` sorted by id.
pub async fn shards_of(store: &MemoryStore, parent: &str) -> Vec<(String, Value)> {
    let mut shards: Vec<(String, Value)> = store
        .list_children(parent, "shards")
        .await
        .unwrap()
        .into_iter()
        .map(|doc| (doc.id, Value::Object(doc.fields)))
        .collect();
    shards.sort_by(|a, b| a.0.cmp(&b.0));
    shards
}
