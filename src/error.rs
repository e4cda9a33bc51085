/// Error types for the synchronization engine.
///
/// Errors fall into two families. Client errors (malformed mutations, missing
/// namespace binding, bad query parameters) are rejected before any write
/// happens. Server errors (SQLite failures, poisoned locks, failed blocking
/// tasks) abort the current transaction, which rolls back as a unit.
///
/// Write conflicts are deliberately absent from this hierarchy: a stale
/// `base_updated_at` is a normal outcome of optimistic concurrency and is
/// reported through [`crate::types::MutationOutcome`], never as an error.
use thiserror::Error;

/// The main error type for synchronization operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A mutation in the submitted batch is structurally invalid
    #[error("Invalid mutation at index {index}: {reason}")]
    InvalidMutation {
        /// Position of the offending operation in the batch
        index: usize,
        /// Description of what is wrong with it
        reason: String,
    },

    /// Request body or parameters could not be understood
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The request was not bound to a namespace by the auth layer
    #[error("Request is not bound to a namespace")]
    MissingNamespace,

    /// Underlying SQLite failure
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Serialization error when converting entity payloads to/from JSON
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Storage operation failed outside of SQLite itself
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the error was caused by the caller's input.
    ///
    /// Client errors are rejected before any write; everything else is a
    /// server-side failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidMutation { .. }
                | SyncError::InvalidRequest(_)
                | SyncError::MissingNamespace
        )
    }
}

/// Result type alias for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;
