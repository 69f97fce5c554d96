//! Error types for Readgate.

use thiserror::Error;

/// Main error type for Readgate operations.
#[derive(Error, Debug)]
pub enum ReadgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A caller passed arguments the limiter cannot honor
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Counter store errors
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for ReadgateError {
    fn from(err: config::ConfigError) -> Self {
        ReadgateError::Config(err.to_string())
    }
}

/// Errors raised by a [`CounterStore`](crate::store::CounterStore).
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backing database rejected or failed an operation
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be mapped back into a counter
    #[error("Corrupt counter row: {0}")]
    Corrupt(String),

    /// The store cannot be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for Readgate operations.
pub type Result<T> = std::result::Result<T, ReadgateError>;

/// Result type alias for counter store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
