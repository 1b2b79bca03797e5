//! Error types for fieldsync-core

use std::time::Duration;

use thiserror::Error;

/// Result type alias using fieldsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fieldsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// A durable write to the local database failed
    #[error("Durability error: {0}")]
    Durability(#[from] rusqlite::Error),

    /// Local store adapter failure outside of SQLite
    #[error("Local store error: {0}")]
    Store(String),

    /// Transient network failure talking to the remote authority
    #[error("Network error: {0}")]
    Network(String),

    /// Remote call exceeded its deadline
    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    /// Payload rejected, locally or by the server
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation exhausted its retry budget
    #[error("Operation {operation_id} exhausted retries after {attempts} attempts")]
    ExhaustedRetries {
        operation_id: String,
        attempts: u32,
    },

    /// Requested row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Local data integrity is at risk; the caller must surface this immediately.
    pub const fn is_durability(&self) -> bool {
        matches!(self, Self::Durability(_) | Self::Store(_) | Self::Io(_))
    }

    /// Transient failures that the retry manager may schedule again.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}
