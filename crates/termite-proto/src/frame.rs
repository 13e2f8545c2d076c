//! Length-prefixed framing.
//!
//! Wire format, shared by every termite channel:
//!
//! ```text
//! +----------------+----------------+----------------+
//! | Length (4B BE) | Kind (4B BE)   | Payload        |
//! +----------------+----------------+----------------+
//! ```
//!
//! Length covers the kind word plus the payload.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RpcError;

/// Upper bound on a single frame. Content travels in 256 KiB chunks and
/// file sets stay small; anything near this limit is a protocol violation.
pub const MAX_FRAME: u32 = 64 * 1024 * 1024;

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameKind {
    /// Handshake: random nonce the peer must answer.
    Challenge = 0x0001,
    /// Handshake: HMAC over the peer's nonce.
    ChallengeReply = 0x0002,
    /// Channel preamble sent once after authentication.
    Hello = 0x0003,
    /// RPC request envelope.
    Request = 0x0010,
    /// RPC response envelope.
    Response = 0x0011,
}

impl FrameKind {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x0001 => Some(Self::Challenge),
            0x0002 => Some(Self::ChallengeReply),
            0x0003 => Some(Self::Hello),
            0x0010 => Some(Self::Request),
            0x0011 => Some(Self::Response),
            _ => None,
        }
    }
}

/// Reads a single frame from the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(FrameKind, Vec<u8>), RpcError> {
    let mut header = [0u8; 8];
    reader.read_exact(&mut header).await?;

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let kind_raw = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

    if length > MAX_FRAME {
        return Err(RpcError::FrameTooLarge(length));
    }
    let kind = FrameKind::from_u32(kind_raw).ok_or(RpcError::UnknownFrame(kind_raw))?;

    // Length includes the kind word.
    let payload_len = (length as usize).saturating_sub(4);
    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await?;
    }
    Ok((kind, payload))
}

/// Writes a single frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    kind: FrameKind,
    payload: &[u8],
) -> Result<(), RpcError> {
    let length = 4 + payload.len() as u32;
    if length > MAX_FRAME {
        return Err(RpcError::FrameTooLarge(length));
    }

    let mut buf = BytesMut::with_capacity(8 + payload.len());
    buf.put_u32(length);
    buf.put_u32(kind as u32);
    buf.extend_from_slice(payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Serializes an RPC payload.
pub(crate) fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, RpcError> {
    bincode::serialize(value).map_err(|e| RpcError::Codec(e.to_string()))
}

/// Deserializes an RPC payload.
pub(crate) fn decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, RpcError> {
    bincode::deserialize(payload).map_err(|e| RpcError::Codec(e.to_string()))
}
