//! Centralized error types for mailsummary.

use std::path::PathBuf;
use thiserror::Error;

/// All errors produced by the mailsummary library.
#[derive(Error, Debug)]
pub enum SummaryError {
    /// I/O error with the associated file path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Decoding found malformed or truncated data.
    #[error("Corrupt record: {reason}")]
    CorruptRecord { reason: String },

    /// The on-disk format version is outside the range we can read.
    #[error("Unsupported summary version {found} (supported: {minimum} to {current})")]
    UnsupportedVersion {
        found: i32,
        minimum: i32,
        current: i32,
    },

    /// An internal consistency check failed.
    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    /// A lookup by uid, path, key or index failed.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An add was attempted with a key that is already present.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

/// Convenience alias for `Result<T, SummaryError>`.
pub type Result<T> = std::result::Result<T, SummaryError>;

impl SummaryError {
    /// Create an `Io` variant from a path and an `io::Error`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a `CorruptRecord` variant.
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptRecord {
            reason: reason.into(),
        }
    }

    /// Whether this is an `Io` error of kind `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Allow `?` on `std::io::Error` inside functions returning `SummaryError`
/// when no path context is available (rare, prefer `SummaryError::io`).
impl From<std::io::Error> for SummaryError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            path: PathBuf::from("<unknown>"),
            source,
        }
    }
}
