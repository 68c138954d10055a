use std::fmt;
use thiserror::Error;

/// Errors surfaced by a [`DocumentStore`](crate::store::DocumentStore) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Record already exists (create-new write)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The backend does not provide the requested primitive
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Query rejected before execution
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Backend unreachable, throttled or circuit open
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    TimedOut(String),

    /// Anything else reported by the backend
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Check if this error is transient and an idempotent call may be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::TimedOut(_))
    }
}

/// One problem found while validating configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Errors returned by the counter operations and the configuration layer.
#[derive(Error, Debug, Clone)]
pub enum CounterError {
    /// Initializer batch commit failed
    #[error("Batch write failed for {parent}: {source}")]
    BatchWriteFailed { parent: String, source: StoreError },

    /// Writer could not read the chosen shard
    #[error("Shard read failed for {parent} shard {shard}: {source}")]
    ShardReadFailed {
        parent: String,
        shard: u32,
        source: StoreError,
    },

    /// Writer could not write or increment the chosen shard
    #[error("Shard write failed for {parent} shard {shard}: {source}")]
    ShardWriteFailed {
        parent: String,
        shard: u32,
        source: StoreError,
    },

    /// Reader could not enumerate the shard records
    #[error("Aggregation query failed for {parent}: {source}")]
    AggregationQueryFailed { parent: String, source: StoreError },

    /// Family descriptor could not be read
    #[error("Layout read failed for {parent}: {source}")]
    LayoutReadFailed { parent: String, source: StoreError },

    /// Family descriptor could not be created on first write
    #[error("Layout write failed for {parent}: {source}")]
    LayoutWriteFailed { parent: String, source: StoreError },

    /// Stored family descriptor disagrees with the configured shard count
    #[error(
        "Shard count mismatch for {parent} family '{family}': configured {configured}, stored {stored}"
    )]
    ShardCountMismatch {
        parent: String,
        family: String,
        configured: u32,
        stored: u32,
    },

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Validation error with messages
    #[error("Validation error: {}", .0.iter().map(|i| i.to_string()).collect::<Vec<_>>().join("; "))]
    ValidationError(Vec<ValidationIssue>),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(String),

    /// Parse/serialization error
    #[error("Parse error: {0}")]
    ParseError(String),
}

impl CounterError {
    /// The underlying store error, if this failure came from the store.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            CounterError::BatchWriteFailed { source, .. }
            | CounterError::ShardReadFailed { source, .. }
            | CounterError::ShardWriteFailed { source, .. }
            | CounterError::AggregationQueryFailed { source, .. }
            | CounterError::LayoutReadFailed { source, .. }
            | CounterError::LayoutWriteFailed { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Check if this error is transient.
    ///
    /// Only reads are safe to retry blindly: a retried increment whose
    /// acknowledgment was lost applies its delta twice.
    pub fn is_transient(&self) -> bool {
        self.store_error().is_some_and(StoreError::is_transient)
    }
}

/// Errors returned by the feed fan-out reader.
#[derive(Error, Debug, Clone)]
pub enum FeedError {
    /// One of the batched IN queries failed; no partial feed is returned
    #[error("Feed query failed for batch {batch}: {source}")]
    QueryFailed { batch: usize, source: StoreError },
}

// === Conversion Implementations ===

macro_rules! impl_from_error {
    ($err_type:ty, $arm:pat => $body:expr) => {
        impl From<$err_type> for CounterError {
            fn from(err: $err_type) -> Self {
                match err {
                    $arm => $body,
                }
            }
        }
    };
}

impl_from_error!(std::io::Error, e => match e.kind() {
    std::io::ErrorKind::InvalidInput => CounterError::InvalidArgument(e.to_string()),
    _ => CounterError::IoError(e.to_string()),
});

impl_from_error!(serde_json::Error, e => CounterError::ParseError(e.to_string()));
impl_from_error!(toml::de::Error, e => CounterError::ParseError(e.to_string()));

/// Result type alias for counter operations.
pub type CounterResult<T> = Result<T, CounterError>;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
