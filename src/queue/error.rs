use thiserror::Error;

/// Failures raised by an appointment store adapter.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Two writers produced the same `(scheduled_date, queue_number)`.
    #[error("queue number conflict: {0}")]
    Conflict(String),

    /// A compare-and-set write found the row changed by another writer.
    #[error("row changed concurrently: {0}")]
    Stale(String),

    #[error("row not found: {0}")]
    RowNotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::Database(e),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("{field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("{0} not found")]
    NotFound(String),

    /// A concurrent write won, even after the automatic retry; the caller may retry.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("transaction failed: {0}")]
    Transaction(#[source] StoreError),
}

impl QueueError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        QueueError::Validation {
            field,
            message: message.into(),
        }
    }
}

impl From<StoreError> for QueueError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(msg) | StoreError::Stale(msg) => QueueError::Conflict(msg),
            StoreError::RowNotFound(what) => QueueError::NotFound(what),
            other => QueueError::Transaction(other),
        }
    }
}
