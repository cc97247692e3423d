//! Error types for ring-processor
//!
//! This module defines the error hierarchy that covers:
//! - Range metadata store (SQLite) errors
//! - Data store (keyspace) errors, classified as transient or fatal
//! - Configuration and CLI errors
//!
//! Processor-reported errors live in [`crate::processor`] because they are
//! part of the processor contract rather than infrastructure failures.

use thiserror::Error;

/// Top-level error type for ring-processor
#[derive(Error, Debug)]
pub enum RingError {
    /// Range store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Data store errors
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors (checkpoint and stats files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The processor asked to stop on its first error
    #[error("Processing halted on range {range_id}: {message}")]
    Halted { range_id: i64, message: String },

    /// A worker thread panicked
    #[error("Worker {name} panicked")]
    WorkerPanicked { name: String },
}

/// Range metadata store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Range id not present in any shard
    #[error("Range does not exist: {id}")]
    RangeNotFound { id: i64 },

    /// Sharded table name with no shard tables present
    #[error("No shard tables found for '{table}' (run 'init --shards N' first)")]
    NoShards { table: String },

    /// Schema error
    #[error("Schema error: {0}")]
    Schema(String),

    /// rangeData could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Check if the store was busy or locked by another writer
    pub fn is_busy(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Data store (keyspace) errors
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    /// Operation timed out
    #[error("Timed out during {operation}")]
    Timeout { operation: String },

    /// Store unreachable or connection lost
    #[error("Data store unavailable: {reason}")]
    Unavailable { reason: String },

    /// Store returned a status code
    #[error("Data store error {code}: {message}")]
    Status { code: u16, message: String },

    /// Key is not known to the store
    #[error("Unknown key '{key}'")]
    UnknownKey { key: String },

    /// Redis error that is not a connection problem
    #[error("Redis error: {0}")]
    Redis(String),
}

impl SourceError {
    /// Check if this error is transient (retry locally, requeue when exhausted)
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Timeout { .. } | SourceError::Unavailable { .. } => true,
            SourceError::Status { code, message } => {
                matches!(code, 408 | 503) || message.starts_with("TSocket: timed out")
            }
            SourceError::UnknownKey { .. } | SourceError::Redis(_) => false,
        }
    }
}

impl From<redis::RedisError> for SourceError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            SourceError::Timeout {
                operation: "redis command".into(),
            }
        } else if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            SourceError::Unavailable {
                reason: err.to_string(),
            }
        } else {
            SourceError::Redis(err.to_string())
        }
    }
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Partitioner name not recognized
    #[error("Unknown partitioner type: {0}")]
    UnknownPartitioner(String),

    /// Range count is zero or wider than the token interval
    #[error("Invalid range count {count}: must be between 1 and the token interval width")]
    InvalidRangeCount { count: usize },

    /// Token bounds are inverted
    #[error("Invalid token bounds: min {min} must be below max {max}")]
    InvalidBounds { min: String, max: String },

    /// Token string is not an integer
    #[error("Invalid token '{0}'")]
    InvalidToken(String),

    /// Batch size bounds
    #[error("Invalid batch size bounds: min {min}, max {max}")]
    InvalidBatchSize { min: usize, max: usize },

    /// Batch time window
    #[error("Invalid batch time window: min {min}s, max {max}s")]
    InvalidBatchTime { min: f64, max: f64 },

    /// Table name cannot be used in SQL
    #[error("Invalid table name '{0}': expected letters, digits and underscores, optionally ending in '*'")]
    InvalidTableName(String),

    /// Instance count
    #[error("Invalid instance count {count}: must be between 1 and {max}")]
    InvalidInstanceCount { count: usize, max: usize },

    /// Missing required configuration
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

/// Result type alias for RingError
pub type Result<T> = std::result::Result<T, RingError>;

/// Result type alias for StoreError
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for SourceError
pub type SourceResult<T> = std::result::Result<T, SourceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_transient() {
        let timeout = SourceError::Timeout {
            operation: "get_keys".into(),
        };
        assert!(timeout.is_transient());

        let unavailable = SourceError::Status {
            code: 503,
            message: "unavailable".into(),
        };
        assert!(unavailable.is_transient());

        let socket = SourceError::Status {
            code: 0,
            message: "TSocket: timed out reading 4 bytes".into(),
        };
        assert!(socket.is_transient());

        let bad_request = SourceError::Status {
            code: 400,
            message: "bad request".into(),
        };
        assert!(!bad_request.is_transient());

        let unknown = SourceError::UnknownKey { key: "k".into() };
        assert!(!unknown.is_transient());
    }

    #[test]
    fn test_error_conversion() {
        let err = StoreError::RangeNotFound { id: 7 };
        let ring_err: RingError = err.into();
        assert!(matches!(ring_err, RingError::Store(StoreError::RangeNotFound { id: 7 })));
        assert_eq!(ring_err.to_string(), "Store error: Range does not exist: 7");
    }

    #[test]
    fn test_store_error_busy() {
        let busy = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_busy());
        assert!(!StoreError::Schema("x".into()).is_busy());
    }
}
