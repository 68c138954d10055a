pub mod cache;
pub mod config;
pub mod counter;
pub mod error;
pub mod feed;
pub mod layout;
pub mod metrics;
pub mod search;
pub mod store;
pub mod striped;

pub use cache::{Cache, CacheStats, ValueCache};
pub use config::{CliArgs, Config};
pub use counter::{CounterValues, ShardSelector, ShardedCounter, WriteStrategy};
pub use error::{CounterError, CounterResult, FeedError, StoreError};
pub use feed::FeedReader;
pub use layout::{shard_location, CounterFamily, ShardLocation};
pub use metrics::CounterMetrics;
pub use search::{Candidate, CandidateProvider, SearchChain};
pub use store::{DocumentStore, MemoryStore, RetryingStore};

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

/// One counter operation against a snapshot-backed store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Init { parent: String, fields: Vec<String> },
    Incr { parent: String, field: String, delta: i64 },
    Get { parent: String, field: Option<String> },
    Verify { parent: String },
}

impl Command {
    fn mutates(&self) -> bool {
        matches!(self, Command::Init { .. } | Command::Incr { .. })
    }
}

/// Load the store snapshot at `data`, run `command` on counter family
/// `family` and persist the snapshot again if the command wrote anything.
///
/// Returns the text to show the user.
pub async fn run(config: Config, data: &Path, family: &str, command: Command) -> Result<String> {
    tracing::debug!(config = ?config, data = %data.display(), "configuration loaded");

    let store = Arc::new(
        MemoryStore::load_snapshot(data)
            .await
            .with_context(|| format!("Failed to load store snapshot {}", data.display()))?,
    );
    let metrics = Arc::new(CounterMetrics::new());
    let retrying = RetryingStore::from_config(Arc::clone(&store), &config.retry)
        .with_metrics(Arc::clone(&metrics));
    let counter = ShardedCounter::from_config(retrying, &config, family)
        .context("Failed to build counter")?
        .with_metrics(Arc::clone(&metrics));

    let output = match &command {
        Command::Init { parent, fields } => {
            counter
                .initialize_counters(parent, fields.as_slice())
                .await
                .with_context(|| format!("Failed to initialize counters of {}", parent))?;
            format!(
                "initialized {} field(s) on {} across {} shards",
                fields.len(),
                parent,
                counter.family().shards()
            )
        }
        Command::Incr {
            parent,
            field,
            delta,
        } => {
            counter
                .increment_by(parent, field, *delta)
                .await
                .with_context(|| format!("Failed to increment {} of {}", field, parent))?;
            let value = counter.get_counter_value(parent, field).await?;
            format!("{} = {}", field, value)
        }
        Command::Get {
            parent,
            field: Some(field),
        } => counter.get_counter_value(parent, field).await?.to_string(),
        Command::Get {
            parent,
            field: None,
        } => counter
            .get_all_counter_values(parent)
            .await?
            .iter()
            .map(|(field, value)| format!("{} = {}", field, value))
            .collect::<Vec<_>>()
            .join("\n"),
        Command::Verify { parent } => match counter.verify_layout(parent).await? {
            Some(shards) => format!("{}: {} shards, layout ok", parent, shards),
            None => format!("{}: not initialized", parent),
        },
    };

    if command.mutates() {
        store
            .save_snapshot(data)
            .await
            .with_context(|| format!("Failed to save store snapshot {}", data.display()))?;
    }

    metrics.log_summary();
    Ok(output)
}
