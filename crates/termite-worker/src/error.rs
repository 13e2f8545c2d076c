//! Error types for the worker.

use termite_error::CommonError;
use termite_proto::RpcError;
use termite_store::StoreError;
use thiserror::Error;

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Errors that can occur in worker operations.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Common errors (I/O, policy, etc.).
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Content store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// RPC error on the reverse channel to the master.
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    /// No mirror exists for the session key a request named.
    #[error("unknown mirror {0}")]
    UnknownMirror(String),
}

impl From<std::io::Error> for WorkerError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(CommonError::from(err))
    }
}
