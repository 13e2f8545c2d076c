//! Wire types, framed socket channels, and the authenticated RPC glue.
//!
//! Every connection speaks length-prefixed frames and starts with a
//! shared-secret challenge-response handshake followed by a channel
//! preamble: [`RPC_CHANNEL`] carries multiplexed request/response frames,
//! other channel ids carry raw bytes for a specific job's stdin or stdout.

mod coordinator;
mod error;
mod frame;
mod handshake;
mod message;
mod rpc;

pub use coordinator::{list_workers, register_worker};
pub use error::RpcError;
pub use frame::{read_frame, write_frame, FrameKind, MAX_FRAME};
pub use handshake::{
    accept_channel, connection_id, dial_tcp, dial_unix, handshake_acceptor, handshake_initiator,
    Hello, REVERSE_CHANNEL, RPC_CHANNEL,
};
pub use message::{
    AttrRequest, AttrResponse, ContentRequest, ContentResponse, MirrorStatus, Registration,
    Request, Response, UpdateRequest, WorkRequest, WorkResponse, WorkerStatusResponse,
};
pub use rpc::{serve_connection, RpcClient, Service};
