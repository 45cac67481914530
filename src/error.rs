//! Error types for compound file operations.
//!
//! Every failure the engine can report is a variant of [`Error`]. Messages
//! carry the entry name, sector index or chain position involved so that a
//! corrupted file can be diagnosed from the error alone.
use thiserror::Error;

/// Main error type for compound file operations.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error from the underlying byte store
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Cyclic or out-of-bounds allocation chain, malformed header or directory
    #[error("Corrupted file: {0}")]
    CorruptedFile(String),

    /// A lookup by name found nothing
    #[error("Item not found: {0}")]
    ItemNotFound(String),

    /// Name is empty, too long or contains a forbidden character
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// A sibling with the same name (case-insensitively) already exists
    #[error("Name collision: {0}")]
    NameCollision(String),

    /// Mutating call on an instance opened read-only
    #[error("Read-only violation: {0}")]
    ReadOnly(String),

    /// Handle used after its owning file was closed or its entry deleted
    #[error("Disposed object: {0}")]
    Disposed(String),

    /// Operation that cannot be performed in the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    /// Whether this error reports a structurally damaged container
    pub fn is_corrupted(&self) -> bool {
        matches!(self, Error::CorruptedFile(_))
    }

    pub(crate) fn corrupted(msg: impl Into<String>) -> Self {
        Error::CorruptedFile(msg.into())
    }
}

/// Result type for compound file operations.
pub type Result<T> = std::result::Result<T, Error>;
