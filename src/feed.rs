//! Feed assembly from the records of followed authors.

use crate::error::FeedError;
use crate::store::{compare_values, Direction, Document, DocumentStore, Filter, Query, MAX_IN_VALUES};
use futures::future::try_join_all;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::{debug, error, instrument};

/// Reads the newest records written by a set of authors.
///
/// Stores cap IN filters at [`MAX_IN_VALUES`], so the author list is split
/// into chunks queried concurrently and merged client-side.
pub struct FeedReader<S> {
    store: S,
    collection: String,
    author_field: String,
    time_field: String,
    page_limit: usize,
}

impl<S: DocumentStore> FeedReader<S> {
    pub fn new(
        store: S,
        collection: impl Into<String>,
        author_field: impl Into<String>,
        time_field: impl Into<String>,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            author_field: author_field.into(),
            time_field: time_field.into(),
            page_limit: 50,
        }
    }

    /// Upper bound on `limit` for a single fetch.
    pub fn with_page_limit(mut self, page_limit: usize) -> Self {
        self.page_limit = page_limit;
        self
    }

    /// Newest first, at most `limit` records (capped at the page limit).
    #[instrument(skip(self, followed), fields(collection = %self.collection, authors = followed.len()))]
    pub async fn fetch(&self, followed: &[String], limit: usize) -> Result<Vec<Document>, FeedError> {
        let limit = limit.min(self.page_limit);
        let mut seen = HashSet::new();
        let authors: Vec<Value> = followed
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .map(|id| Value::String(id.clone()))
            .collect();
        if authors.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let queries = authors.chunks(MAX_IN_VALUES).enumerate().map(|(batch, chunk)| {
            let query = Query::collection(self.collection.clone())
                .filter(Filter::is_in(self.author_field.clone(), chunk.to_vec()))
                .order_by(self.time_field.clone(), Direction::Descending)
                .limit(limit);
            async move {
                self.store.query(&query).await.map_err(|source| {
                    error!(operation = "feed", batch = batch, error = %source, "feed query failed");
                    FeedError::QueryFailed { batch, source }
                })
            }
        });
        let batches = try_join_all(queries).await?;
        let batch_count = batches.len();

        let mut merged: Vec<Document> = batches.into_iter().flatten().collect();
        merged.sort_by(|a, b| self.newest_first(a, b));
        merged.truncate(limit);

        debug!(
            operation = "feed",
            batches = batch_count,
            returned = merged.len()
        );
        Ok(merged)
    }

    fn newest_first(&self, a: &Document, b: &Document) -> Ordering {
        let (ta, tb) = (
            a.fields.get(&self.time_field).unwrap_or(&Value::Null),
            b.fields.get(&self.time_field).unwrap_or(&Value::Null),
        );
        compare_values(tb, ta).then_with(|| a.id.cmp(&b.id))
    }
}
