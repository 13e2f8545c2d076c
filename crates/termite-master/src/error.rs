//! Error types for the master.

use termite_error::CommonError;
use termite_proto::RpcError;
use termite_store::StoreError;
use thiserror::Error;

/// Result type alias for master operations.
pub type Result<T> = std::result::Result<T, MasterError>;

/// Errors that can occur in master operations.
#[derive(Debug, Error)]
pub enum MasterError {
    /// Common errors (I/O, policy, no-workers, etc.).
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Content store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// RPC error on a mirror or coordinator connection.
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    /// The file-set waiter was flushed before this job's files arrived.
    #[error("files were never sent")]
    FilesNeverSent,
}

impl MasterError {
    /// Creates a policy denial.
    #[must_use]
    pub fn policy(msg: impl Into<String>) -> Self {
        Self::Common(CommonError::policy(msg))
    }

    /// Returns true if the caller should fall back to local execution.
    #[must_use]
    pub const fn is_no_workers(&self) -> bool {
        matches!(self, Self::Common(CommonError::NoWorkers))
    }

    /// Returns true for errors that should drop the associated mirror.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        match self {
            Self::Rpc(e) => e.is_transport(),
            Self::Common(CommonError::Transport(_)) => true,
            _ => false,
        }
    }
}

impl From<std::io::Error> for MasterError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(CommonError::from(err))
    }
}
