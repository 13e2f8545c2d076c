//! Multiplexed RPC over one framed channel.
//!
//! Calls are tagged with a `u64` sequence id; a reader task routes each
//! response envelope to the oneshot of its pending call, so any number of
//! calls can be in flight on one connection and responses may arrive out of
//! order. A transport error fails every outstanding call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use termite_error::CommonError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::error::RpcError;
use crate::frame::{decode, encode, read_frame, write_frame, FrameKind};
use crate::message::{Request, Response};

#[derive(Serialize, Deserialize)]
struct RequestEnvelope {
    seq: u64,
    request: Request,
}

#[derive(Serialize, Deserialize)]
struct ResponseEnvelope {
    seq: u64,
    result: Result<Response, String>,
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// None once the connection is closed; calls fail fast after that.
type Pending = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<Result<Response, RpcError>>>>>>;

/// Client half of a multiplexed RPC channel.
pub struct RpcClient {
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Pending,
    seq: AtomicU64,
    reader: JoinHandle<()>,
}

impl RpcClient {
    /// Takes ownership of an authenticated stream and starts the response
    /// router.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let router = tokio::spawn(read_loop(Box::new(reader), Arc::clone(&pending)));
        Self {
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            seq: AtomicU64::new(1),
            reader: router,
        }
    }

    /// Issues one call and waits for its response.
    pub async fn call(&self, request: Request) -> Result<Response, RpcError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("rpc pending poisoned");
            match pending.as_mut() {
                Some(map) => {
                    map.insert(seq, tx);
                }
                None => return Err(RpcError::ConnectionClosed),
            }
        }

        let payload = encode(&RequestEnvelope { seq, request })?;
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = write_frame(&mut *writer, FrameKind::Request, &payload).await {
                if let Some(map) = self.pending.lock().expect("rpc pending poisoned").as_mut() {
                    map.remove(&seq);
                }
                return Err(e);
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::ConnectionClosed),
        }
    }

    /// Closes the channel, failing every outstanding call.
    pub fn close(&self) {
        self.reader.abort();
        if let Some(map) = self.pending.lock().expect("rpc pending poisoned").take() {
            for (_, tx) in map {
                let _ = tx.send(Err(RpcError::ConnectionClosed));
            }
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let outstanding = self
            .pending
            .lock()
            .ok()
            .and_then(|p| p.as_ref().map(HashMap::len));
        f.debug_struct("RpcClient")
            .field("outstanding", &outstanding)
            .finish()
    }
}

async fn read_loop(mut reader: BoxedReader, pending: Pending) {
    loop {
        let envelope = match read_frame(&mut reader).await {
            Ok((FrameKind::Response, payload)) => match decode::<ResponseEnvelope>(&payload) {
                Ok(env) => env,
                Err(e) => {
                    warn!(error = %e, "undecodable response frame");
                    break;
                }
            },
            Ok((kind, _)) => {
                warn!(?kind, "unexpected frame on rpc channel");
                break;
            }
            Err(_) => break,
        };

        let tx = pending
            .lock()
            .expect("rpc pending poisoned")
            .as_mut()
            .and_then(|map| map.remove(&envelope.seq));
        match tx {
            Some(tx) => {
                let _ = tx.send(envelope.result.map_err(RpcError::Remote));
            }
            None => trace!(seq = envelope.seq, "response for a forgotten call"),
        }
    }

    if let Some(map) = pending.lock().expect("rpc pending poisoned").take() {
        for (_, tx) in map {
            let _ = tx.send(Err(RpcError::ConnectionClosed));
        }
    }
}

/// One endpoint's view of the RPC surface it serves.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Handles one request. Errors travel to the caller as strings.
    async fn handle(&self, request: Request) -> Result<Response, CommonError>;
}

/// Serves requests on an authenticated stream until the peer hangs up.
///
/// Each request runs in its own task so long calls do not block the
/// channel; content fetches stay responsive while a job executes.
pub async fn serve_connection<S>(stream: S, service: Arc<dyn Service>) -> Result<(), RpcError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(tokio::sync::Mutex::new(writer));

    loop {
        let (kind, payload) = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(RpcError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if kind != FrameKind::Request {
            warn!(?kind, "unexpected frame on serving channel");
            continue;
        }
        let envelope: RequestEnvelope = decode(&payload)?;

        let service = Arc::clone(&service);
        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            let result = service
                .handle(envelope.request)
                .await
                .map_err(|e| e.to_string());
            let payload = match encode(&ResponseEnvelope {
                seq: envelope.seq,
                result,
            }) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "response encoding failed");
                    return;
                }
            };
            let mut writer = writer.lock().await;
            if let Err(e) = write_frame(&mut *writer, FrameKind::Response, &payload).await {
                warn!(error = %e, "response write failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Registration, WorkRequest, WorkResponse};
    use std::time::Duration;

    struct EchoService;

    #[async_trait]
    impl Service for EchoService {
        async fn handle(&self, request: Request) -> Result<Response, CommonError> {
            match request {
                Request::MirrorRun(req) => {
                    // The slow path, to prove calls interleave.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Response::Run(WorkResponse {
                        exit: 0,
                        stdout: req.binary.into_bytes(),
                        ..Default::default()
                    }))
                }
                Request::CoordinatorRegister(r) => Ok(Response::Registered {
                    registrations: vec![r],
                }),
                Request::CoordinatorList => Ok(Response::Registered {
                    registrations: Vec::new(),
                }),
                _ => Err(CommonError::policy("unsupported in echo")),
            }
        }
    }

    fn spawn_pair() -> RpcClient {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_connection(server_side, Arc::new(EchoService)));
        RpcClient::new(client_side)
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let client = spawn_pair();
        let resp = client
            .call(Request::CoordinatorRegister(Registration {
                address: "w1:1234".into(),
            }))
            .await
            .unwrap();
        match resp {
            Response::Registered { registrations } => {
                assert_eq!(registrations[0].address, "w1:1234");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_interleave() {
        let client = Arc::new(spawn_pair());

        // A slow call followed by a fast one; the fast one must not wait.
        let slow_client = Arc::clone(&client);
        let slow = tokio::spawn(async move {
            slow_client
                .call(Request::MirrorRun(WorkRequest {
                    binary: "/bin/slow".into(),
                    ..Default::default()
                }))
                .await
        });

        let fast = client.call(Request::CoordinatorList).await.unwrap();
        assert!(matches!(fast, Response::Registered { .. }));

        match slow.await.unwrap().unwrap() {
            Response::Run(r) => assert_eq!(r.stdout, b"/bin/slow"),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_remote_error_surfaces() {
        let client = spawn_pair();
        let err = client.call(Request::WorkerStatus).await.unwrap_err();
        match err {
            RpcError::Remote(msg) => assert!(msg.contains("unsupported")),
            other => panic!("expected Remote, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_calls_fail_after_close() {
        let client = spawn_pair();
        client.close();
        let err = client.call(Request::CoordinatorList).await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_peer_hangup_fails_outstanding_calls() {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let client = RpcClient::new(client_side);

        let pending = tokio::spawn(async move { client.call(Request::CoordinatorList).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(server_side);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
    }
}
