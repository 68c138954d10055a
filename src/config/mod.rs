//! Configuration management for CLI, environment variables, and config files.

use crate::counter::WriteStrategy;
use crate::error::{CounterError, ValidationIssue};
use crate::layout::{DEFAULT_COLLECTION, DEFAULT_SHARDS, DESCRIPTOR_COLLECTION, MAX_SHARDS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Main configuration for loop-counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub counters: CountersConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Shard layout and write behaviour of counter families.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CountersConfig {
    pub default_shards: u32,
    pub collection: String,
    pub write_strategy: WriteStrategy,
}

/// Configuration for caching behavior. TTLs are seconds; 0 disables the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub aggregate_ttl_secs: u64,
    pub search_ttl_secs: u64,
    pub max_entries: usize,
}

/// Read retries and circuit breaker for [`RetryingStore`](crate::store::RetryingStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub failure_threshold: u32,
    pub breaker_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub max_results: usize,
    pub recent_batch: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub page_limit: usize,
}

/// Configuration for logging output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for CountersConfig {
    fn default() -> Self {
        Self {
            default_shards: DEFAULT_SHARDS,
            collection: DEFAULT_COLLECTION.to_string(),
            write_strategy: WriteStrategy::Auto,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            aggregate_ttl_secs: 0,
            search_ttl_secs: 300,
            max_entries: 1000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 500,
            failure_threshold: 5,
            breaker_timeout_secs: 30,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results: 20,
            recent_batch: 100,
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { page_limit: 50 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn parse_env<T: FromStr>(name: &str, val: &str) -> Result<T, CounterError> {
    val.parse()
        .map_err(|_| CounterError::InvalidArgument(format!("{} has invalid format", name)))
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self, CounterError> {
        let content = std::fs::read_to_string(path)?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());
        match ext.as_deref() {
            Some("json") => Ok(serde_json::from_str(&content)?),
            _ => Ok(toml::from_str(&content)?),
        }
    }

    pub fn from_default_locations() -> Result<Self, CounterError> {
        let config_dirs = [
            dirs::config_dir().map(|d| d.join("loop-counters/config.toml")),
            Some(PathBuf::from("/etc/loop-counters/config.toml")),
            Some(PathBuf::from("./loop-counters.toml")),
        ];

        for path in config_dirs.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        Ok(Self::default())
    }

    pub fn merge_from_env(mut self) -> Result<Self, CounterError> {
        const PREFIX: &str = "LOOP_COUNTERS_";
        let var = |name: &str| std::env::var(format!("{}{}", PREFIX, name)).ok();

        if let Some(val) = var("SHARDS") {
            self.counters.default_shards = parse_env("LOOP_COUNTERS_SHARDS", &val)?;
        }
        if let Some(val) = var("COLLECTION") {
            self.counters.collection = val;
        }
        if let Some(val) = var("WRITE_STRATEGY") {
            self.counters.write_strategy = parse_env("LOOP_COUNTERS_WRITE_STRATEGY", &val)?;
        }
        if let Some(val) = var("AGGREGATE_TTL") {
            self.cache.aggregate_ttl_secs = parse_env("LOOP_COUNTERS_AGGREGATE_TTL", &val)?;
        }
        if let Some(val) = var("SEARCH_TTL") {
            self.cache.search_ttl_secs = parse_env("LOOP_COUNTERS_SEARCH_TTL", &val)?;
        }
        if let Some(val) = var("MAX_ENTRIES") {
            self.cache.max_entries = parse_env("LOOP_COUNTERS_MAX_ENTRIES", &val)?;
        }
        if let Some(val) = var("MAX_RETRIES") {
            self.retry.max_retries = parse_env("LOOP_COUNTERS_MAX_RETRIES", &val)?;
        }
        if let Some(val) = var("LOG_LEVEL") {
            self.logging.level = val;
        }

        Ok(self)
    }

    pub fn merge_from_cli(mut self, cli: &CliArgs) -> Self {
        if let Some(shards) = cli.shards {
            self.counters.default_shards = shards;
        }

        if let Some(strategy) = cli.write_strategy {
            self.counters.write_strategy = strategy;
        }

        if let Some(ref level) = cli.log_level {
            self.logging.level = level.clone();
        }

        self
    }

    pub fn load() -> Result<Self, CounterError> {
        Self::from_default_locations()?.merge_from_env()
    }

    pub fn load_with_cli(cli: &CliArgs) -> Result<Self, CounterError> {
        let base = match cli.config_file {
            Some(ref path) => Self::from_file(path)?,
            None => Self::from_default_locations()?,
        };
        Ok(base.merge_from_env()?.merge_from_cli(cli))
    }

    pub fn validate(&self) -> Result<(), CounterError> {
        let mut issues = Vec::new();

        if self.counters.default_shards == 0 || self.counters.default_shards > MAX_SHARDS {
            issues.push(ValidationIssue {
                field: "counters.default_shards".to_string(),
                message: format!("Shard count must be in 1..={}", MAX_SHARDS),
            });
        }

        let collection = &self.counters.collection;
        if collection.is_empty() || collection.contains('/') || collection == DESCRIPTOR_COLLECTION
        {
            issues.push(ValidationIssue {
                field: "counters.collection".to_string(),
                message: format!(
                    "Collection '{}' must be a single non-reserved path segment",
                    collection
                ),
            });
        }

        if self.cache.max_entries == 0 {
            issues.push(ValidationIssue {
                field: "cache.max_entries".to_string(),
                message: "Cache must hold at least one entry".to_string(),
            });
        }

        if self.retry.failure_threshold == 0 {
            issues.push(ValidationIssue {
                field: "retry.failure_threshold".to_string(),
                message: "Failure threshold must be at least 1".to_string(),
            });
        }

        if self.search.max_results == 0 {
            issues.push(ValidationIssue {
                field: "search.max_results".to_string(),
                message: "Search must return at least one result".to_string(),
            });
        }

        if self.feed.page_limit == 0 {
            issues.push(ValidationIssue {
                field: "feed.page_limit".to_string(),
                message: "Feed page limit must be at least 1".to_string(),
            });
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            issues.push(ValidationIssue {
                field: "logging.level".to_string(),
                message: format!(
                    "Invalid log level '{}'. Valid levels: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            });
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(CounterError::ValidationError(issues))
        }
    }
}

/// Command-line arguments that override configuration values.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config_file: Option<PathBuf>,
    pub shards: Option<u32>,
    pub write_strategy: Option<WriteStrategy>,
    pub log_level: Option<String>,
}
