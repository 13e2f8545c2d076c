//! Error types for the RPC layer.

use thiserror::Error;

/// Errors that can occur on a framed RPC channel.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The peer declared a frame larger than the protocol allows.
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u32),

    /// The peer sent a frame kind this endpoint does not understand.
    #[error("unknown frame kind {0}")]
    UnknownFrame(u32),

    /// The shared-secret handshake failed. Sessions are rejected silently;
    /// this is only ever reported locally.
    #[error("authentication failed")]
    AuthFailed,

    /// The remote service reported an error for this call.
    #[error("{0}")]
    Remote(String),

    /// The connection closed while a call was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// The remote answered with a response of the wrong variant.
    #[error("unexpected response variant")]
    UnexpectedResponse,
}

impl RpcError {
    /// Returns true for errors that should make the caller drop the
    /// associated mirror connection.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed | Self::FrameTooLarge(_) | Self::UnknownFrame(_)
        )
    }
}
