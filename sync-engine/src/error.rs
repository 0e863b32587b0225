use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Queue item {item_id} not found")]
    ItemNotFound { item_id: String },

    #[error("Conflict {conflict_id} not found")]
    ConflictNotFound { conflict_id: String },

    #[error("Invalid item ID: {0}")]
    InvalidItemId(String),

    #[error("Invalid queue status: {0}")]
    InvalidStatus(String),

    #[error("Invalid sync operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid {field}: {message}")]
    InvalidInput { field: String, message: String },

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Remote store error: {0}")]
    Store(String),

    #[error("Dispatch attempt timed out after {0}ms")]
    AttemptTimeout(u64),

    #[error("Network is offline")]
    Offline,

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
