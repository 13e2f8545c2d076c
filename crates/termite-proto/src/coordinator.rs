//! Client side of the coordinator protocol.
//!
//! Workers register their serving address on an interval; masters list the
//! currently-registered set when refreshing their worker map.

use crate::error::RpcError;
use crate::handshake::{dial_tcp, RPC_CHANNEL};
use crate::message::{Registration, Request, Response};
use crate::rpc::RpcClient;

/// Fetches the currently-registered worker addresses.
pub async fn list_workers(addr: &str, secret: &[u8]) -> Result<Vec<String>, RpcError> {
    let stream = dial_tcp(addr, secret, RPC_CHANNEL, "").await?;
    let client = RpcClient::new(stream);
    let response = client.call(Request::CoordinatorList).await;
    client.close();
    match response? {
        Response::Registered { registrations } => {
            Ok(registrations.into_iter().map(|r| r.address).collect())
        }
        _ => Err(RpcError::UnexpectedResponse),
    }
}

/// Registers a worker's serving address with the coordinator.
pub async fn register_worker(addr: &str, secret: &[u8], address: &str) -> Result<(), RpcError> {
    let stream = dial_tcp(addr, secret, RPC_CHANNEL, "").await?;
    let client = RpcClient::new(stream);
    let response = client
        .call(Request::CoordinatorRegister(Registration {
            address: address.to_owned(),
        }))
        .await;
    client.close();
    match response? {
        Response::Ok => Ok(()),
        _ => Err(RpcError::UnexpectedResponse),
    }
}
