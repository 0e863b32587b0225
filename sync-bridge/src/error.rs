use serde_json::Value;
use thiserror::Error;

/// Errors produced by the remote task store and connectivity bridges.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The entity's version no longer matches the caller's base version.
    ///
    /// `current_values` is `None` when the entity has been deleted remotely.
    #[error("Version conflict: remote entity is at version {current_version}")]
    Conflict {
        current_version: i64,
        current_values: Option<Value>,
    },

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Rejected by store: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Whether the failure is worth retrying with backoff.
    ///
    /// Conflicts are never transient (they route to conflict resolution) and
    /// `Rejected`/`NotFound` indicate caller-side problems the retry loop
    /// cannot fix.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Timeout | StoreError::Unavailable(_) => true,
            StoreError::Server { status, .. } => *status >= 500,
            StoreError::Conflict { .. } | StoreError::NotFound(_) | StoreError::Rejected(_) => {
                false
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Timeout.is_transient());
        assert!(StoreError::Unavailable("connection reset".to_string()).is_transient());
        assert!(StoreError::Server {
            status: 503,
            message: "unavailable".to_string()
        }
        .is_transient());

        assert!(!StoreError::Server {
            status: 400,
            message: "bad request".to_string()
        }
        .is_transient());
        assert!(!StoreError::Conflict {
            current_version: 2,
            current_values: None
        }
        .is_transient());
        assert!(!StoreError::NotFound("task-1".to_string()).is_transient());
        assert!(!StoreError::Rejected("schema".to_string()).is_transient());
    }
}
