//! The worker: accepts mirror sessions, grants job slots, and reports to
//! the coordinator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use termite_error::CommonError;
use termite_proto::{
    accept_channel, register_worker, serve_connection, ContentResponse, MirrorStatus, Request,
    Response, RpcClient, Service, WorkerStatusResponse, REVERSE_CHANNEL, RPC_CHANNEL,
};
use termite_store::ContentStore;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::WorkerOptions;
use crate::error::{Result, WorkerError};
use crate::mirror::WorkerMirror;

const REVERSE_WAIT: Duration = Duration::from_secs(5);

/// The worker runtime.
pub struct Worker {
    options: WorkerOptions,
    secret: Vec<u8>,
    store: Arc<ContentStore>,
    mirrors: Mutex<HashMap<String, Arc<WorkerMirror>>>,
    // Reverse channels that arrived before their CreateMirror call.
    pending_reverse: Mutex<HashMap<String, Arc<RpcClient>>>,
    reverse_arrived: Notify,
    granted_total: AtomicU32,
}

impl Worker {
    /// Builds a worker from its options.
    pub fn new(options: WorkerOptions) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&options.temp_dir)?;
        let store = Arc::new(ContentStore::new(&options.store)?);
        let secret = options.secret.clone().into_bytes();
        Ok(Arc::new(Self {
            options,
            secret,
            store,
            mirrors: Mutex::new(HashMap::new()),
            pending_reverse: Mutex::new(HashMap::new()),
            reverse_arrived: Notify::new(),
            granted_total: AtomicU32::new(0),
        }))
    }

    /// The worker's content store.
    #[must_use]
    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// Binds the mirror listener, walking the port range, registers with
    /// the coordinator, and serves until the listener fails.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut listener = None;
        for offset in 0..=self.options.port_retry {
            let addr = format!("0.0.0.0:{}", self.options.port + offset);
            match TcpListener::bind(&addr).await {
                Ok(bound) => {
                    listener = Some(bound);
                    break;
                }
                Err(e) => debug!(%addr, error = %e, "port taken"),
            }
        }
        let listener = listener.ok_or_else(|| {
            CommonError::config(format!(
                "no free port in {}..={}",
                self.options.port,
                self.options.port + self.options.port_retry
            ))
        })?;

        let local = listener.local_addr().map_err(CommonError::from)?;
        self.start_reporting(local.to_string());
        self.serve(listener).await
    }

    /// Serves mirror sessions on an already-bound listener.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "worker listening");
        loop {
            let (mut stream, peer) = listener.accept().await.map_err(CommonError::from)?;
            let worker = Arc::clone(self);
            tokio::spawn(async move {
                let hello = match accept_channel(&mut stream, &worker.secret).await {
                    Ok(hello) => hello,
                    Err(_) => {
                        // Rejected silently on secret mismatch.
                        debug!(%peer, "worker handshake failed");
                        return;
                    }
                };
                match hello.channel {
                    RPC_CHANNEL => {
                        let service = Arc::new(MirrorService {
                            worker: Arc::clone(&worker),
                            key: hello.key.clone(),
                        });
                        let _ = serve_connection(stream, service as Arc<dyn Service>).await;
                        // The master hung up; the session is over.
                        worker.remove_mirror(&hello.key);
                    }
                    REVERSE_CHANNEL => {
                        let client = Arc::new(RpcClient::new(stream));
                        worker
                            .pending_reverse
                            .lock()
                            .expect("pending reverse poisoned")
                            .insert(hello.key, client);
                        worker.reverse_arrived.notify_waiters();
                    }
                    other => warn!(%peer, channel = other, "unexpected channel on worker"),
                }
            });
        }
    }

    /// Registers with the coordinator on the report interval.
    pub fn start_reporting(self: &Arc<Self>, address: String) {
        if self.options.coordinator.is_empty() {
            return;
        }
        let worker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = register_worker(
                    &worker.options.coordinator,
                    &worker.secret,
                    &address,
                )
                .await
                {
                    warn!(error = %e, "coordinator registration failed");
                }
                tokio::time::sleep(worker.options.report_interval()).await;
            }
        });
    }

    /// Live mirror sessions and their running jobs.
    #[must_use]
    pub fn status(&self) -> WorkerStatusResponse {
        let mirrors = self.mirrors.lock().expect("worker mirrors poisoned");
        WorkerStatusResponse {
            mirrors: mirrors
                .values()
                .map(|m| MirrorStatus {
                    key: m.key().to_owned(),
                    granted_jobs: m.granted_jobs(),
                    running_jobs: m.running_jobs(),
                })
                .collect(),
        }
    }

    async fn create_mirror(&self, key: String, wanted_jobs: u32) -> Result<u32> {
        let reverse = self.wait_for_reverse(&key).await?;

        let remaining = self
            .options
            .jobs
            .saturating_sub(self.granted_total.load(Ordering::Acquire));
        let granted = wanted_jobs.min(remaining);
        if granted == 0 {
            return Ok(0);
        }

        let view_dir = self.options.temp_dir.join(&key);
        let mirror = WorkerMirror::new(
            key.clone(),
            granted,
            reverse,
            Arc::clone(&self.store),
            view_dir,
        )?;
        self.granted_total.fetch_add(granted, Ordering::AcqRel);
        self.mirrors
            .lock()
            .expect("worker mirrors poisoned")
            .insert(key.clone(), mirror);
        info!(mirror = %key, granted, "mirror created");
        Ok(granted)
    }

    async fn wait_for_reverse(&self, key: &str) -> Result<Arc<RpcClient>> {
        let deadline = Instant::now() + REVERSE_WAIT;
        loop {
            let notified = self.reverse_arrived.notified();
            if let Some(client) = self
                .pending_reverse
                .lock()
                .expect("pending reverse poisoned")
                .remove(key)
            {
                return Ok(client);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(
                    CommonError::transport("reverse channel never arrived").into()
                );
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    fn remove_mirror(&self, key: &str) {
        let mirror = self
            .mirrors
            .lock()
            .expect("worker mirrors poisoned")
            .remove(key);
        if let Some(mirror) = mirror {
            debug!(mirror = %key, "mirror removed");
            self.granted_total
                .fetch_sub(mirror.granted_jobs(), Ordering::AcqRel);
            mirror.close();
        }
        // A reverse channel that never got its CreateMirror is dropped too.
        self.pending_reverse
            .lock()
            .expect("pending reverse poisoned")
            .remove(key);
    }

    fn mirror(&self, key: &str) -> Result<Arc<WorkerMirror>> {
        self.mirrors
            .lock()
            .expect("worker mirrors poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| WorkerError::UnknownMirror(key.to_owned()))
    }
}

/// Per-connection service for one master's forward channel.
struct MirrorService {
    worker: Arc<Worker>,
    key: String,
}

#[async_trait]
impl Service for MirrorService {
    async fn handle(&self, request: Request) -> std::result::Result<Response, CommonError> {
        match request {
            Request::CreateMirror { key, wanted_jobs } => {
                let granted = self
                    .worker
                    .create_mirror(key, wanted_jobs)
                    .await
                    .map_err(into_common)?;
                Ok(Response::MirrorCreated {
                    granted_jobs: granted,
                })
            }
            Request::MirrorUpdate(update) => {
                let mirror = self.worker.mirror(&self.key).map_err(into_common)?;
                mirror.update_files(&update.files);
                Ok(Response::Ok)
            }
            Request::MirrorRun(req) => {
                let mirror = self.worker.mirror(&self.key).map_err(into_common)?;
                let resp = mirror.run_job(&req).await.map_err(into_common)?;
                Ok(Response::Run(resp))
            }
            Request::FileContent(req) => {
                let chunk = self
                    .worker
                    .store
                    .serve(&req)
                    .map_err(|e| CommonError::not_found(e.to_string()))?;
                Ok(Response::FileContent(ContentResponse {
                    chunk: chunk.to_vec(),
                }))
            }
            Request::WorkerStatus => Ok(Response::WorkerStatus(self.worker.status())),
            _ => Err(CommonError::policy("not a worker request")),
        }
    }
}

fn into_common(err: WorkerError) -> CommonError {
    match err {
        WorkerError::Common(c) => c,
        other => CommonError::internal(other.to_string()),
    }
}
