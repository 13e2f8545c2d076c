//! Shared-secret handshake and channel preamble.
//!
//! Every connection authenticates both ways before any payload flows: each
//! side issues a random challenge and the peer answers with an HMAC-SHA256
//! over it keyed by the shared secret. A session is rejected silently on
//! mismatch. After authentication the connecting side sends a [`Hello`]
//! naming the channel.

use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::error::RpcError;
use crate::frame::{decode, encode, read_frame, write_frame, FrameKind};

type HmacSha256 = Hmac<Sha256>;

/// The control channel: multiplexed RPC frames.
pub const RPC_CHANNEL: u64 = 0;

/// The reverse channel of a mirror session: the worker is the RPC client,
/// the master serves its file system.
pub const REVERSE_CHANNEL: u64 = 1;

const NONCE_LEN: usize = 20;

#[derive(Serialize, Deserialize)]
struct Challenge {
    nonce: [u8; NONCE_LEN],
}

#[derive(Serialize, Deserialize)]
struct ChallengeReply {
    mac: Vec<u8>,
}

/// Channel preamble, sent once by the connecting side after authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// [`RPC_CHANNEL`], [`REVERSE_CHANNEL`], or a stream id from
    /// [`connection_id`].
    pub channel: u64,
    /// Session key tying a reverse channel to its mirror; empty otherwise.
    pub key: String,
}

fn mac_for(secret: &[u8], nonce: &[u8]) -> Result<Vec<u8>, RpcError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| RpcError::AuthFailed)?;
    mac.update(nonce);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn verify_mac(secret: &[u8], nonce: &[u8], reply: &[u8]) -> Result<(), RpcError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| RpcError::AuthFailed)?;
    mac.update(nonce);
    mac.verify_slice(reply).map_err(|_| RpcError::AuthFailed)
}

fn new_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Runs the connecting side of the mutual handshake.
pub async fn handshake_initiator<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    secret: &[u8],
) -> Result<(), RpcError> {
    let my_nonce = new_nonce();
    write_frame(
        stream,
        FrameKind::Challenge,
        &encode(&Challenge { nonce: my_nonce })?,
    )
    .await?;

    let (kind, payload) = read_frame(stream).await?;
    if kind != FrameKind::Challenge {
        return Err(RpcError::AuthFailed);
    }
    let peer: Challenge = decode(&payload)?;

    let (kind, payload) = read_frame(stream).await?;
    if kind != FrameKind::ChallengeReply {
        return Err(RpcError::AuthFailed);
    }
    let reply: ChallengeReply = decode(&payload)?;
    verify_mac(secret, &my_nonce, &reply.mac)?;

    write_frame(
        stream,
        FrameKind::ChallengeReply,
        &encode(&ChallengeReply {
            mac: mac_for(secret, &peer.nonce)?,
        })?,
    )
    .await?;
    Ok(())
}

/// Runs the accepting side of the mutual handshake.
pub async fn handshake_acceptor<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    secret: &[u8],
) -> Result<(), RpcError> {
    let (kind, payload) = read_frame(stream).await?;
    if kind != FrameKind::Challenge {
        return Err(RpcError::AuthFailed);
    }
    let peer: Challenge = decode(&payload)?;

    let my_nonce = new_nonce();
    write_frame(
        stream,
        FrameKind::Challenge,
        &encode(&Challenge { nonce: my_nonce })?,
    )
    .await?;
    write_frame(
        stream,
        FrameKind::ChallengeReply,
        &encode(&ChallengeReply {
            mac: mac_for(secret, &peer.nonce)?,
        })?,
    )
    .await?;

    let (kind, payload) = read_frame(stream).await?;
    if kind != FrameKind::ChallengeReply {
        return Err(RpcError::AuthFailed);
    }
    let reply: ChallengeReply = decode(&payload)?;
    verify_mac(secret, &my_nonce, &reply.mac)
}

/// Authenticates an accepted connection and reads its channel preamble.
pub async fn accept_channel<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    secret: &[u8],
) -> Result<Hello, RpcError> {
    handshake_acceptor(stream, secret).await?;
    let (kind, payload) = read_frame(stream).await?;
    if kind != FrameKind::Hello {
        return Err(RpcError::AuthFailed);
    }
    decode(&payload)
}

async fn send_hello<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    secret: &[u8],
    channel: u64,
    key: &str,
) -> Result<(), RpcError> {
    handshake_initiator(stream, secret).await?;
    write_frame(
        stream,
        FrameKind::Hello,
        &encode(&Hello {
            channel,
            key: key.to_owned(),
        })?,
    )
    .await
}

/// Dials a TCP peer, authenticates, and opens the named channel.
pub async fn dial_tcp(
    addr: &str,
    secret: &[u8],
    channel: u64,
    key: &str,
) -> Result<TcpStream, RpcError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    send_hello(&mut stream, secret, channel, key).await?;
    Ok(stream)
}

/// Dials a Unix-domain peer, authenticates, and opens the named channel.
pub async fn dial_unix(
    path: &Path,
    secret: &[u8],
    channel: u64,
    key: &str,
) -> Result<UnixStream, RpcError> {
    let mut stream = UnixStream::connect(path).await?;
    send_hello(&mut stream, secret, channel, key).await?;
    Ok(stream)
}

/// Allocates an id for a stdin/stdout side channel.
#[must_use]
pub fn connection_id() -> u64 {
    rand::thread_rng().gen_range(2..u64::MAX)
}
