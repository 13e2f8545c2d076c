//! Common error types shared across Termite crates.

use thiserror::Error;

/// Common errors that occur across multiple Termite crates.
///
/// This enum provides a unified set of error variants for scenarios like I/O
/// failures, policy denials, and resource exhaustion. Crate-specific errors
/// should wrap this type using the `#[from]` attribute.
#[derive(Debug, Error)]
pub enum CommonError {
    /// I/O error from the standard library.
    ///
    /// The most common error type, wrapping `std::io::Error` for filesystem
    /// operations, network I/O, and other system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    ///
    /// Indicates invalid or missing configuration values, malformed config
    /// files, or configuration validation failures.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport error on an RPC or socket connection.
    ///
    /// The associated mirror is dropped; retry policy lives with the
    /// request runner.
    #[error("transport error: {0}")]
    Transport(String),

    /// Integrity error.
    ///
    /// Digest mismatch after a fetch, stat drift during a destructive save,
    /// or an impossible rename. The content store may be corrupt; callers
    /// must stop rather than produce wrong artifacts.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// No workers are available to run a job.
    ///
    /// Surfaced as a distinct kind so the caller can fall back to local
    /// execution.
    #[error("no workers found at all")]
    NoWorkers,

    /// Policy denial.
    ///
    /// Non-absolute binary path, private-path access, or a write to the
    /// read-only view. Reported to the client; the worker is not penalised.
    #[error("policy denied: {0}")]
    Policy(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal error.
    ///
    /// A catch-all for unexpected internal errors. Should include enough
    /// context for debugging.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CommonError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new transport error.
    #[must_use]
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Creates a new integrity error.
    #[must_use]
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    /// Creates a new policy denial.
    #[must_use]
    pub fn policy(msg: impl Into<String>) -> Self {
        Self::Policy(msg.into())
    }

    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if this is an integrity error.
    #[must_use]
    pub const fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }

    /// Returns true if this is the no-workers error.
    #[must_use]
    pub const fn is_no_workers(&self) -> bool {
        matches!(self, Self::NoWorkers)
    }

    /// Returns true if this is a policy denial.
    #[must_use]
    pub const fn is_policy(&self) -> bool {
        matches!(self, Self::Policy(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let common_err: CommonError = io_err.into();
        assert!(common_err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_transport_error() {
        let err = CommonError::transport("connection reset by peer");
        assert!(err.is_transport());
        assert_eq!(err.to_string(), "transport error: connection reset by peer");
    }

    #[test]
    fn test_integrity_error() {
        let err = CommonError::integrity("digest mismatch");
        assert!(err.is_integrity());
        assert_eq!(err.to_string(), "integrity error: digest mismatch");
    }

    #[test]
    fn test_no_workers_error() {
        let err = CommonError::NoWorkers;
        assert!(err.is_no_workers());
        assert_eq!(err.to_string(), "no workers found at all");
    }

    #[test]
    fn test_policy_error() {
        let err = CommonError::policy("binary path must be absolute");
        assert!(err.is_policy());
        assert_eq!(err.to_string(), "policy denied: binary path must be absolute");
    }
}
