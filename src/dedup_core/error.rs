use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DedupError>;

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("Index error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("Index migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory walker error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Access denied: {0}")]
    AccessDenied(PathBuf),

    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("Unsupported media: {0}")]
    UnsupportedMedia(PathBuf),

    #[error("Decode failure ({stage}): {path}")]
    DecodeFailure { path: PathBuf, stage: &'static str },

    #[error("Index conflict persisted after retries")]
    IndexConflict,

    #[error("Atomic write failed for {path}: {reason}")]
    AtomicWriteFailed { path: PathBuf, reason: String },

    #[error("Transaction not found")]
    TransactionNotFound,

    #[error("Incomplete transaction: {0}")]
    IncompleteTransaction(String),

    #[error("Transaction state mismatch: expected {expected}, found {found}")]
    StateMismatch { expected: String, found: String },

    #[error(
        "Refusing to touch managed photo library at {0}. \
         Managed libraries must be deduplicated from the owning application; \
         point this tool at plain folders instead."
    )]
    ManagedLibraryRefusal(PathBuf),

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid date format: {0}")]
    InvalidDateFormat(String),

    #[error("Argument error: {0}")]
    Argument(String),

    #[error("Index not found at {0}")]
    IndexNotFound(PathBuf),

    #[error("Index schema corrupted: {0}")]
    SchemaCorrupted(String),
}

impl DedupError {
    /// Whether this error must stop the whole orchestration, as opposed to
    /// being reported per-file and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DedupError::SchemaCorrupted(_)
                | DedupError::Migration(_)
                | DedupError::IndexConflict
                | DedupError::AtomicWriteFailed { .. }
                | DedupError::Cancelled
        )
    }
}
