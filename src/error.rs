// Keyfed — Top-level error types
//
// Aggregates errors from the store and federation modules into a single
// error enum for the application boundary.

use thiserror::Error;

/// Top-level error type for all Keyfed operations.
#[derive(Debug, Error)]
pub enum KeyfedError {
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("Import error: {0}")]
    Import(#[from] crate::federation::ImportError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] crate::federation::FetchError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, KeyfedError>;
