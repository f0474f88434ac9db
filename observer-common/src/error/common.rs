//! Error types for the observer pipeline.
//!
//! One enum per concern. Crate-specific errors can wrap these with `#[from]`.

use thiserror::Error;

/// Configuration loading and validation errors. Fatal at startup.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// Required field is missing
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Field has an invalid value
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// Configuration file could not be read or parsed
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Network-level errors from the HTTP fetcher.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum NetworkError {
    /// Request could not be sent or the connection dropped
    #[error("Request failed: {0}")]
    Request(String),

    /// Provider answered 429/403
    #[error("Blocked by remote (status {0})")]
    Blocked(u16),

    /// Any other non-success status
    #[error("Bad status: {0}")]
    Status(u16),

    /// Response body could not be read
    #[error("Body read failed: {0}")]
    Body(String),

    /// Proxy URL rejected by the client builder
    #[error("Invalid proxy: {0}")]
    InvalidProxy(String),

    /// HTTP client could not be constructed
    #[error("Client build failed: {0}")]
    ClientBuild(String),

    /// Proxy scrape returned nothing usable
    #[error("Proxy refresh failed: {0}")]
    ProxyRefresh(String),

    /// All retry attempts were consumed
    #[error("Max retries exceeded: {0}")]
    RetriesExhausted(String),
}

/// Data-source errors. Per-symbol failures are skipped; these surface when a
/// whole fetch or a lifecycle transition fails.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DataSourceError {
    #[error("Network error for {symbol}: {source}")]
    Fetch {
        symbol: String,
        #[source]
        source: NetworkError,
    },

    /// Provider payload could not be decoded
    #[error("Parse error for {symbol}: {reason}")]
    Parse { symbol: String, reason: String },

    /// Every symbol in a batch failed
    #[error("All {0} fetches failed")]
    AllFetchesFailed(usize),

    #[error("Source {0} is already running")]
    AlreadyRunning(String),

    #[error("Source {0} is not running")]
    NotRunning(String),

    #[error("Source {0} not found")]
    NotFound(String),

    #[error("Source {0} already exists")]
    AlreadyExists(String),
}

/// Database errors. Logged by the orchestrator; the pipeline continues and
/// consistency is eventual via idempotent upserts.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DatabaseError {
    #[error("Query failed: {0}")]
    Query(String),

    #[error("Database connection failed: {0}")]
    Connection(String),

    #[error("Connection pool exhausted")]
    PoolExhausted,
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => DatabaseError::PoolExhausted,
            sqlx::Error::Io(_) => DatabaseError::Connection(err.to_string()),
            _ => DatabaseError::Query(err.to_string()),
        }
    }
}

/// Validation errors drop the offending sample at parse time.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ValidationError {
    /// Timestamp/quote arrays of a chart response disagree in length
    #[error("{symbol}: mismatched array lengths")]
    Misaligned { symbol: String },

    /// A point carried a null field or an out-of-range value
    #[error("{symbol}: invalid point at index {index}: {reason}")]
    InvalidPoint {
        symbol: String,
        index: usize,
        reason: String,
    },

    #[error("Validation failed: {0}")]
    Custom(String),
}
