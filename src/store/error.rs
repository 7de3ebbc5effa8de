// Keyfed — Store error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Partner not found: {0}")]
    PartnerNotFound(String),

    #[error("Invalid partner configuration: {0}")]
    InvalidPartner(String),

    #[error("Lease ttl must be positive, got {0}ms")]
    InvalidTtl(i64),

    #[error("Corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },

    #[error("Database connection lock poisoned")]
    Poisoned,
}
