//! Multi-strategy record search.
//!
//! Document stores without full-text search are queried through a chain of
//! [`CandidateProvider`]s, cheapest first: an indexed prefix query, then a
//! client-side filter over the most recent records, then a full scan. The
//! [`SearchChain`] merges what they return, drops duplicates and ranks the
//! rest.

use crate::cache::ValueCache;
use crate::error::StoreResult;
use crate::store::{Direction, Document, DocumentStore, Filter, Query};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub display_name: String,
    /// Provider that found this candidate first
    pub source: String,
}

/// One way of finding candidates for a search term.
#[async_trait]
pub trait CandidateProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Up to `limit` candidates matching `term` (already trimmed, non-empty).
    async fn find(&self, term: &str, limit: usize) -> StoreResult<Vec<Candidate>>;
}

/// Which fields of a collection a provider reads.
#[derive(Debug, Clone)]
pub struct SearchFields {
    pub collection: String,
    /// Field shown to the user and used for ranking
    pub display_field: String,
    /// Fields matched case-insensitively by the client-side filters
    pub match_fields: Vec<String>,
}

impl SearchFields {
    fn candidate(&self, doc: &Document, source: &str) -> Candidate {
        let display_name = doc
            .fields
            .get(&self.display_field)
            .and_then(|v| v.as_str())
            .unwrap_or(&doc.id)
            .to_string();
        Candidate {
            id: doc.id.clone(),
            display_name,
            source: source.to_string(),
        }
    }

    fn matches(&self, doc: &Document, term_lower: &str) -> bool {
        self.match_fields.iter().any(|field| {
            doc.fields
                .get(field)
                .and_then(|v| v.as_str())
                .is_some_and(|s| s.to_lowercase().contains(term_lower))
        })
    }
}

/// Indexed prefix query on a lower-cased copy of the search field.
pub struct PrefixProvider<S> {
    store: S,
    fields: SearchFields,
    lowercase_field: String,
}

impl<S: DocumentStore> PrefixProvider<S> {
    pub fn new(store: S, fields: SearchFields, lowercase_field: impl Into<String>) -> Self {
        Self {
            store,
            fields,
            lowercase_field: lowercase_field.into(),
        }
    }
}

#[async_trait]
impl<S: DocumentStore> CandidateProvider for PrefixProvider<S> {
    fn name(&self) -> &str {
        "prefix"
    }

    async fn find(&self, term: &str, limit: usize) -> StoreResult<Vec<Candidate>> {
        let query = Query::collection(self.fields.collection.clone())
            .filter(Filter::prefix(
                self.lowercase_field.clone(),
                term.to_lowercase(),
            ))
            .limit(limit);
        let docs = self.store.query(&query).await?;
        Ok(docs
            .iter()
            .map(|doc| self.fields.candidate(doc, self.name()))
            .collect())
    }
}

/// Client-side substring filter over the `batch` most recent records.
pub struct RecentScanProvider<S> {
    store: S,
    fields: SearchFields,
    time_field: String,
    batch: usize,
}

impl<S: DocumentStore> RecentScanProvider<S> {
    pub fn new(store: S, fields: SearchFields, time_field: impl Into<String>, batch: usize) -> Self {
        Self {
            store,
            fields,
            time_field: time_field.into(),
            batch,
        }
    }
}

#[async_trait]
impl<S: DocumentStore> CandidateProvider for RecentScanProvider<S> {
    fn name(&self) -> &str {
        "recent"
    }

    async fn find(&self, term: &str, limit: usize) -> StoreResult<Vec<Candidate>> {
        let query = Query::collection(self.fields.collection.clone())
            .order_by(self.time_field.clone(), Direction::Descending)
            .limit(self.batch);
        let term_lower = term.to_lowercase();
        let docs = self.store.query(&query).await?;
        Ok(docs
            .iter()
            .filter(|doc| self.fields.matches(doc, &term_lower))
            .take(limit)
            .map(|doc| self.fields.candidate(doc, self.name()))
            .collect())
    }
}

/// Last resort: client-side substring filter over every record.
pub struct FullScanProvider<S> {
    store: S,
    fields: SearchFields,
}

impl<S: DocumentStore> FullScanProvider<S> {
    pub fn new(store: S, fields: SearchFields) -> Self {
        Self { store, fields }
    }
}

#[async_trait]
impl<S: DocumentStore> CandidateProvider for FullScanProvider<S> {
    fn name(&self) -> &str {
        "full_scan"
    }

    async fn find(&self, term: &str, limit: usize) -> StoreResult<Vec<Candidate>> {
        let query = Query::collection(self.fields.collection.clone());
        let term_lower = term.to_lowercase();
        let docs = self.store.query(&query).await?;
        Ok(docs
            .iter()
            .filter(|doc| self.fields.matches(doc, &term_lower))
            .take(limit)
            .map(|doc| self.fields.candidate(doc, self.name()))
            .collect())
    }
}

/// Cache of ranked results keyed by lower-cased term.
pub type SearchCache = dyn ValueCache<String, Vec<Candidate>>;

/// Ordered fallback chain of providers with de-duplication and ranking.
pub struct SearchChain {
    providers: Vec<Arc<dyn CandidateProvider>>,
    max_results: usize,
    cache: Option<(Arc<SearchCache>, Duration)>,
}

impl SearchChain {
    pub fn new(max_results: usize) -> Self {
        Self {
            providers: Vec::new(),
            max_results: max_results.max(1),
            cache: None,
        }
    }

    /// Append a provider; providers run in the order they were added.
    pub fn provider(mut self, provider: Arc<dyn CandidateProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_cache(mut self, cache: Arc<SearchCache>, ttl: Duration) -> Self {
        self.cache = Some((cache, ttl));
        self
    }

    /// Ranked candidates for `term`, at most `max_results`.
    ///
    /// Best effort: a failing provider is logged and skipped, and the
    /// incomplete result is returned without being cached.
    pub async fn search(&self, term: &str) -> Vec<Candidate> {
        let term = term.trim();
        if term.is_empty() {
            return Vec::new();
        }
        let term_lower = term.to_lowercase();

        if let Some((cache, _)) = &self.cache {
            if let Some(hit) = cache.get(&term_lower).await {
                debug!(operation = "search", term = %term_lower, "cache hit");
                return hit;
            }
        }

        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        let mut degraded = false;
        for provider in &self.providers {
            if merged.len() >= self.max_results {
                break;
            }
            match provider.find(term, self.max_results).await {
                Ok(found) => {
                    let before = merged.len();
                    merged.extend(found.into_iter().filter(|c| seen.insert(c.id.clone())));
                    debug!(
                        operation = "search",
                        provider = provider.name(),
                        added = merged.len() - before
                    );
                }
                Err(e) => {
                    degraded = true;
                    warn!(
                        operation = "search",
                        provider = provider.name(),
                        error = %e,
                        "provider failed, skipping"
                    );
                }
            }
        }

        rank_candidates(&mut merged, &term_lower);
        merged.truncate(self.max_results);

        // results missing a failed provider's share are not cached
        if let Some((cache, ttl)) = &self.cache {
            if !degraded {
                cache.set(term_lower, merged.clone(), *ttl).await;
            }
        }
        merged
    }
}

fn match_rank(name_lower: &str, term_lower: &str) -> u8 {
    if name_lower == term_lower {
        0
    } else if name_lower.starts_with(term_lower) {
        1
    } else if name_lower.contains(term_lower) {
        2
    } else {
        3
    }
}

/// Exact matches first, then prefix, then substring, then the rest; within
/// a tier shorter names first, then alphabetical.
pub fn rank_candidates(candidates: &mut [Candidate], term_lower: &str) {
    candidates.sort_by_cached_key(|c| {
        let name_lower = c.display_name.to_lowercase();
        (
            match_rank(&name_lower, term_lower),
            name_lower.chars().count(),
            name_lower,
        )
    });
}
