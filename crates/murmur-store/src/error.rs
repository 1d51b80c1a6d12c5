use murmur_shared::{CallId, CallRole, UpdateRejected};
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The shared signaling store could not be reached.
    #[error("Signaling store unavailable: {0}")]
    Unavailable(String),

    /// No signaling record with this id.
    #[error("Call record not found: {0}")]
    RecordNotFound(CallId),

    /// A party tried to write a field owned by the other party.
    #[error("{role} may not write {fields}")]
    NotPermitted { role: CallRole, fields: String },

    /// The merge would break the record's status order or set-once fields.
    #[error("Update rejected: {0}")]
    Rejected(#[from] UpdateRejected),

    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),
}

impl StoreError {
    /// Whether the failure means the backing store was unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
