//! Common error types for the offline sync core.

use thiserror::Error;

/// Top-level error type for sync, queue, cache and storage operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A record status change was attempted from a state that does not allow it.
    #[error("Invalid state transition for record {id}: {from} -> {to}")]
    InvalidStateTransition {
        id: String,
        from: String,
        to: String,
    },

    /// An earlier mutation for the same entity has not finished yet.
    #[error("Record {id} is blocked behind an unfinished mutation for {entity}")]
    OutOfOrder { id: String, entity: String },

    /// Transient remote failure; may succeed on a later attempt.
    #[error("Retryable execution error: {0}")]
    RetryableExecution(String),

    /// Permanent remote rejection; never retried.
    #[error("Fatal execution error: {0}")]
    FatalExecution(String),

    /// Local and remote state diverged for an entity.
    #[error("Conflict detected: {0}")]
    ConflictDetected(String),

    /// A policy predicate prevented an automatic sync pass.
    #[error("Gating condition not met: {0}")]
    GatingConditionNotMet(String),

    /// A sync pass was requested while another one is running.
    #[error("A sync pass is already in progress")]
    ConcurrentSyncRejected,

    /// The conflict cannot be cleared without a caller-supplied payload.
    #[error("Manual resolution required: {0}")]
    ManualResolutionRequired(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Persistence backend failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_message() {
        let err = Error::InvalidStateTransition {
            id: "r1".to_string(),
            from: "PENDING".to_string(),
            to: "COMPLETED".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition for record r1: PENDING -> COMPLETED"
        );
    }

    #[test]
    fn test_serde_json_conversion() {
        let parse: std::result::Result<u32, _> = serde_json::from_str("not-json");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
