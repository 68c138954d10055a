//! Shard layout: where the shard records of a counter family live.
//!
//! A parent record `posts/p1` with the default family stores its shards at
//! `posts/p1/shards/0` .. `posts/p1/shards/{N-1}`. The mapping is pure and
//! stable so every reader finds every shard any writer has touched.

use crate::error::{CounterError, CounterResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Shard count used when the caller does not choose one.
pub const DEFAULT_SHARDS: u32 = 10;

/// Upper bound on shards per family; readers scan all of them.
pub const MAX_SHARDS: u32 = 1000;

/// Sub-collection holding shard records when none is configured.
pub const DEFAULT_COLLECTION: &str = "shards";

/// Sub-collection holding family descriptors.
pub const DESCRIPTOR_COLLECTION: &str = "counter_families";

/// Location of a record in the document store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardLocation {
    pub parent: String,
    pub collection: String,
    pub id: String,
}

impl ShardLocation {
    pub fn new(parent: &str, collection: &str, id: impl Into<String>) -> Self {
        Self {
            parent: normalize_parent(parent).to_string(),
            collection: collection.to_string(),
            id: id.into(),
        }
    }

    /// Full slash-separated path of the record.
    pub fn path(&self) -> String {
        format!("{}/{}/{}", self.parent, self.collection, self.id)
    }

    /// Path of the collection this record belongs to.
    pub fn collection_path(&self) -> String {
        format!("{}/{}", self.parent, self.collection)
    }

    /// Parse a shard id back into its index, rejecting anything outside `[0, shards)`.
    pub fn index_from_id(id: &str, shards: u32) -> Option<u32> {
        // "07" and "+7" are foreign ids, not shard 7
        if id.is_empty() || (id.len() > 1 && id.starts_with('0')) {
            return None;
        }
        if !id.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        id.parse::<u32>().ok().filter(|i| *i < shards)
    }
}

impl fmt::Display for ShardLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}

fn normalize_parent(parent: &str) -> &str {
    parent.trim_matches('/')
}

/// Location of shard `index` for `parent` in the default collection.
pub fn shard_location(parent_path: &str, index: u32) -> ShardLocation {
    ShardLocation::new(parent_path, DEFAULT_COLLECTION, index.to_string())
}

/// Configuration for one family of counters sharing a shard layout.
///
/// The same family value must be used to initialize, write and read a
/// parent's counters. The initializer persists it as a descriptor record so
/// [`ShardedCounter::verify_layout`](crate::counter::ShardedCounter::verify_layout)
/// can detect a later mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterFamily {
    name: String,
    shards: u32,
    collection: String,
}

impl CounterFamily {
    /// Create a family with `shards` shards in the default collection.
    pub fn new(name: impl Into<String>, shards: u32) -> CounterResult<Self> {
        Self::with_collection(name, shards, DEFAULT_COLLECTION)
    }

    pub fn with_collection(
        name: impl Into<String>,
        shards: u32,
        collection: impl Into<String>,
    ) -> CounterResult<Self> {
        let name = name.into();
        let collection = collection.into();

        if name.is_empty() || name.contains('/') {
            return Err(CounterError::InvalidArgument(format!(
                "family name '{}' must be non-empty and contain no '/'",
                name
            )));
        }
        if collection.is_empty() || collection.contains('/') {
            return Err(CounterError::InvalidArgument(format!(
                "collection '{}' must be non-empty and contain no '/'",
                collection
            )));
        }
        if collection == DESCRIPTOR_COLLECTION {
            return Err(CounterError::InvalidArgument(format!(
                "collection '{}' is reserved for family descriptors",
                collection
            )));
        }
        if shards == 0 || shards > MAX_SHARDS {
            return Err(CounterError::InvalidArgument(format!(
                "shard count {} must be in 1..={}",
                shards, MAX_SHARDS
            )));
        }

        Ok(Self {
            name,
            shards,
            collection,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shards(&self) -> u32 {
        self.shards
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Location of shard `index` for `parent`.
    pub fn shard_location(&self, parent: &str, index: u32) -> ShardLocation {
        debug_assert!(index < self.shards);
        ShardLocation::new(parent, &self.collection, index.to_string())
    }

    /// Every shard location of `parent`, in index order.
    pub fn shard_locations(&self, parent: &str) -> impl Iterator<Item = ShardLocation> + '_ {
        let parent = parent.to_string();
        (0..self.shards).map(move |i| self.shard_location(&parent, i))
    }

    /// Location of this family's descriptor record under `parent`.
    pub fn descriptor_location(&self, parent: &str) -> ShardLocation {
        ShardLocation::new(parent, DESCRIPTOR_COLLECTION, self.name.clone())
    }

    /// Fields persisted in the descriptor record.
    pub fn descriptor_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut fields = serde_json::Map::new();
        fields.insert("shards".to_string(), self.shards.into());
        fields.insert(
            "collection".to_string(),
            self.collection.clone().into(),
        );
        fields
    }
}

impl Default for CounterFamily {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            shards: DEFAULT_SHARDS,
            collection: DEFAULT_COLLECTION.to_string(),
        }
    }
}
