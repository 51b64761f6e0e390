//! Store error types.
//!
//! "Not found" is never an error here: lookups return `Ok(None)`.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    // === Rejected before touching the database ===
    #[error("Amount must be greater than zero, got {0}")]
    InvalidAmount(i64),

    #[error("Source and destination account are the same: {0}")]
    SameAccount(i64),

    // === Raised inside a transaction ===
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Nothing affected: {operation}")]
    NothingAffected { operation: &'static str },

    #[error("After-create hook failed: {0}")]
    AfterCreate(#[source] anyhow::Error),

    #[error("Inconsistent state: {0}")]
    Inconsistent(String),

    #[error("Payload encoding failed: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Transaction exceeded deadline of {0:?}")]
    Timeout(Duration),

    /// Rollback failed after the transaction body failed. Both are kept.
    #[error("tx error: {source}, rollback error: {rollback}")]
    Rollback {
        source: Box<StoreError>,
        rollback: sqlx::Error,
    },
}

impl StoreError {
    pub fn nothing_affected(operation: &'static str) -> Self {
        StoreError::NothingAffected { operation }
    }

    /// Stable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::InvalidAmount(_) => "INVALID_AMOUNT",
            StoreError::SameAccount(_) => "SAME_ACCOUNT",
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::NothingAffected { .. } => "NOTHING_AFFECTED",
            StoreError::AfterCreate(_) => "AFTER_CREATE_FAILED",
            StoreError::Inconsistent(_) => "INCONSISTENT_STATE",
            StoreError::Payload(_) => "PAYLOAD_ERROR",
            StoreError::Timeout(_) => "TIMEOUT",
            StoreError::Rollback { .. } => "ROLLBACK_FAILED",
        }
    }

    /// The error that caused the transaction to abort, looking through a
    /// failed rollback.
    pub fn root(&self) -> &StoreError {
        match self {
            StoreError::Rollback { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for PostgreSQL deadlock (40P01) and serialization (40001) failures.
    /// The store never retries these itself.
    pub fn is_lock_conflict(&self) -> bool {
        match self.root() {
            StoreError::Database(sqlx::Error::Database(db)) => {
                matches!(db.code().as_deref(), Some("40P01") | Some("40001"))
            }
            _ => false,
        }
    }
}
