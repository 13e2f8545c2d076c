//! Worker registry.
//!
//! Workers register their serving address on an interval; masters ask for
//! the currently-registered set when refreshing their worker map. Entries
//! not refreshed within the liveness window are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use termite_error::CommonError;
use termite_proto::{
    accept_channel, serve_connection, Registration, Request, Response, Service, RPC_CHANNEL,
};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Shared secret for the connection handshake.
    pub secret: Vec<u8>,
    /// Registrations older than this are considered dead.
    pub liveness_window: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            secret: Vec::new(),
            liveness_window: Duration::from_secs(60),
        }
    }
}

/// The registry service.
pub struct Coordinator {
    secret: Vec<u8>,
    liveness_window: Duration,
    workers: Mutex<HashMap<String, Instant>>,
}

impl Coordinator {
    #[must_use]
    pub fn new(options: CoordinatorOptions) -> Arc<Self> {
        Arc::new(Self {
            secret: options.secret,
            liveness_window: options.liveness_window,
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Accepts and serves registry connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = ?listener.local_addr().ok(), "coordinator listening");
        loop {
            let (mut stream, peer) = listener.accept().await?;
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                let hello = match accept_channel(&mut stream, &this.secret).await {
                    Ok(hello) => hello,
                    Err(_) => {
                        // Rejected silently; the peer just sees a close.
                        debug!(%peer, "coordinator handshake failed");
                        return;
                    }
                };
                if hello.channel != RPC_CHANNEL {
                    warn!(%peer, channel = hello.channel, "unexpected channel on coordinator");
                    return;
                }
                let _ = serve_connection(stream, this as Arc<dyn Service>).await;
            });
        }
    }

    /// Number of live registrations.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        let mut workers = self.workers.lock().expect("coordinator lock poisoned");
        let window = self.liveness_window;
        workers.retain(|_, seen| seen.elapsed() < window);
        workers.len()
    }

    fn list(&self) -> Vec<Registration> {
        let mut workers = self.workers.lock().expect("coordinator lock poisoned");
        let window = self.liveness_window;
        workers.retain(|_, seen| seen.elapsed() < window);
        workers
            .keys()
            .map(|address| Registration {
                address: address.clone(),
            })
            .collect()
    }

    fn register(&self, address: String) {
        debug!(%address, "worker registered");
        self.workers
            .lock()
            .expect("coordinator lock poisoned")
            .insert(address, Instant::now());
    }
}

#[async_trait]
impl Service for Coordinator {
    async fn handle(&self, request: Request) -> Result<Response, CommonError> {
        match request {
            Request::CoordinatorRegister(reg) => {
                self.register(reg.address);
                Ok(Response::Ok)
            }
            Request::CoordinatorList => Ok(Response::Registered {
                registrations: self.list(),
            }),
            _ => Err(CommonError::policy("not a coordinator request")),
        }
    }
}
