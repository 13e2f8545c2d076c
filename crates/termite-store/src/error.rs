//! Error types for the content store.

use termite_attr::Digest;
use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in content store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested blob is not present on disk or in memory.
    #[error("blob {0} is missing")]
    NotFound(Digest),

    /// A blob's observed digest does not match the requested one.
    ///
    /// The store may be corrupt; callers must stop rather than silently
    /// produce wrong artifacts.
    #[error("integrity: digest mismatch, expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    /// A file changed while it was being moved into the store.
    ///
    /// The blob would be mislabelled; treated like corruption.
    #[error("integrity: {0} changed during save")]
    StatDrift(String),

    /// The atomic rename into the sharded location failed.
    #[error("integrity: rename into store failed: {0}")]
    Rename(String),

    /// A streamed save produced fewer bytes than its size hint.
    #[error("integrity: short read, got {got} of {want} bytes")]
    ShortRead { got: u64, want: u64 },

    /// A peer fetch failed in transport.
    #[error("fetch error: {0}")]
    Fetch(String),
}

impl StoreError {
    /// Returns true for errors that indicate possible store corruption.
    ///
    /// These are unrecoverable: the process must stop rather than continue
    /// with a possibly mislabelled blob.
    #[must_use]
    pub const fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::DigestMismatch { .. }
                | Self::StatDrift(_)
                | Self::Rename(_)
                | Self::ShortRead { .. }
        )
    }
}
