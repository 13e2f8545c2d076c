//! The master runtime: local RPC surface, job dispatch, and the
//! producing/observing rendezvous around each completed job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use termite_attr::FileSet;
use termite_error::CommonError;
use termite_proto::{
    accept_channel, dial_tcp, list_workers, serve_connection, ContentRequest, Request, Response,
    RpcClient, RpcError, Service, WorkRequest, WorkResponse, REVERSE_CHANNEL, RPC_CHANNEL,
};
use termite_store::{ContentStore, StoreError};
use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::MasterOptions;
use crate::error::{MasterError, Result};
use crate::fileserver::FileServer;
use crate::mirror::MirrorConnection;
use crate::pool::{MirrorConnector, MirrorPool, PoolOptions};
use crate::replay::{apply_file_set, replay_file_set};
use crate::waiter::Subscription;

enum StdinSlot {
    Ready(Vec<u8>),
    Waiting(oneshot::Sender<Vec<u8>>),
}

/// The master: owns the content store, the file server over the writable
/// root, and the mirror pool.
pub struct Master {
    options: MasterOptions,
    secret: Vec<u8>,
    store: Arc<ContentStore>,
    fs: Arc<FileServer>,
    pool: Arc<MirrorPool>,
    stdin: Mutex<HashMap<u64, StdinSlot>>,
}

impl Master {
    /// Builds a master from its options. Starts pool housekeeping when a
    /// coordinator is configured.
    pub fn new(options: MasterOptions) -> Result<Arc<Self>> {
        if options.writable_root.as_os_str().is_empty() {
            return Err(CommonError::config("writable_root is required").into());
        }
        let store = Arc::new(ContentStore::new(&options.store)?);
        let fs = FileServer::new(
            options.writable_root.clone(),
            Arc::clone(&store),
            options.expose_private,
        );

        let secret = options.secret.clone().into_bytes();
        let connector = Arc::new(MasterConnector {
            secret: secret.clone(),
            coordinator: options.coordinator.clone(),
            fs: Arc::clone(&fs),
        });
        let pool = MirrorPool::new(
            connector,
            PoolOptions {
                wanted_max_jobs: options.max_jobs,
                keep_alive: options.keep_alive(),
                period: options.period(),
            },
        );
        if !options.coordinator.is_empty() {
            pool.start_housekeeping();
        }

        Ok(Arc::new(Self {
            options,
            secret,
            store,
            fs,
            pool,
            stdin: Mutex::new(HashMap::new()),
        }))
    }

    /// The content store.
    #[must_use]
    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// The file server over the writable root.
    #[must_use]
    pub fn file_server(&self) -> &Arc<FileServer> {
        &self.fs
    }

    /// The mirror pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<MirrorPool> {
        &self.pool
    }

    /// Binds the local socket and serves client connections until the
    /// listener fails.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _ = std::fs::remove_file(&self.options.socket);
        if let Some(parent) = self.options.socket.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.options.socket)?;
        info!(socket = %self.options.socket.display(), "master listening");
        self.serve(listener).await
    }

    /// Serves client connections on an already-bound listener.
    pub async fn serve(self: &Arc<Self>, listener: UnixListener) -> Result<()> {
        loop {
            let (mut stream, _) = listener.accept().await?;
            let master = Arc::clone(self);
            tokio::spawn(async move {
                let hello = match accept_channel(&mut stream, &master.secret).await {
                    Ok(hello) => hello,
                    Err(_) => return,
                };
                if hello.channel == RPC_CHANNEL {
                    let service = Arc::new(LocalService {
                        master: Arc::clone(&master),
                    });
                    let _ = serve_connection(stream, service as Arc<dyn Service>).await;
                } else {
                    // A stdin side channel: read to EOF and hand the bytes
                    // to the job that named this id.
                    let mut buf = Vec::new();
                    if stream.read_to_end(&mut buf).await.is_ok() {
                        master.deliver_stdin(hello.channel, buf);
                    }
                }
            });
        }
    }

    /// Shuts down the pool and removes the socket.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        let _ = std::fs::remove_file(&self.options.socket);
    }

    /// Runs one command on some worker, replaying its output into the
    /// writable root before returning.
    pub async fn run(&self, mut req: WorkRequest) -> Result<WorkResponse> {
        if !req.binary.starts_with('/') {
            return Err(MasterError::policy(format!(
                "binary path {:?} must be absolute",
                req.binary
            )));
        }
        if let Some(id) = req.stdin_id {
            if req.stdin.is_none() {
                req.stdin = Some(self.take_stdin(id).await?);
            }
        }

        let mut last_err = MasterError::Common(CommonError::NoWorkers);
        for attempt in 0..=self.options.retry_count {
            let mirror = self.pool.pick().await?;
            match self.run_on_mirror(&mirror, &req).await {
                Ok(resp) => {
                    self.pool.job_done(&mirror).await;
                    return Ok(resp);
                }
                Err(e) if e.is_transport() => {
                    warn!(attempt, worker = %mirror.worker_addr(), error = %e, "job failed in transport");
                    self.pool.drop_mirror(&mirror, &e).await;
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Replays a file set that did not come from any mirror, then queues it
    /// to every mirror.
    pub async fn replay(&self, fset: &FileSet) -> Result<()> {
        apply_file_set(
            self.fs.root(),
            &self.store,
            self.fs.attrs(),
            fset,
        )?;
        self.pool.queue_files(None, fset).await;
        Ok(())
    }

    /// Re-checks the writable root after outside changes and ships the
    /// differences to every mirror.
    pub async fn refresh_attribute_cache(&self) {
        let changed = self.fs.refresh();
        if !changed.is_empty() {
            self.pool.queue_files(None, &FileSet::new(changed)).await;
        }
    }

    async fn run_on_mirror(
        &self,
        mirror: &Arc<MirrorConnection>,
        req: &WorkRequest,
    ) -> Result<WorkResponse> {
        // The worker must see every update queued before this job.
        mirror.send_files().await?;

        let mut sub = mirror.waiter.register();
        let result = self.dispatch_and_wait(mirror, req, &mut sub).await;
        mirror.waiter.unregister(&sub);
        result
    }

    async fn dispatch_and_wait(
        &self,
        mirror: &Arc<MirrorConnection>,
        req: &WorkRequest,
        sub: &mut Subscription,
    ) -> Result<WorkResponse> {
        let resp = mirror.run(req.clone()).await?;

        match &resp.file_set {
            Some(fset) => {
                let client = Arc::clone(mirror.client());
                let fetch = move |creq: ContentRequest| {
                    let client = Arc::clone(&client);
                    async move { fetch_chunk(&client, creq).await }
                };
                let replayed = replay_file_set(
                    self.fs.root(),
                    &self.store,
                    self.fs.attrs(),
                    fset,
                    fetch,
                )
                .await;
                match replayed {
                    Ok(()) => {
                        mirror.note_replayed(resp.file_set_id);
                        self.pool
                            .queue_files(Some(mirror.worker_addr()), fset)
                            .await;
                        mirror.waiter.broadcast(resp.file_set_id, sub.token()).await;
                    }
                    Err(e) => {
                        error!(worker = %mirror.worker_addr(), error = %e, "replay failed");
                        mirror.waiter.flush();
                        self.pool.drop_mirror(mirror, &e).await;
                        return Err(e);
                    }
                }
            }
            None => {
                // The producing job handles replay; wait until it has,
                // unless this id already went through.
                if resp.file_set_id > mirror.last_replayed() {
                    mirror.waiter.wait_for(resp.file_set_id, sub).await?;
                }
            }
        }
        Ok(resp)
    }

    async fn take_stdin(&self, id: u64) -> Result<Vec<u8>> {
        let rx = {
            let mut stdin = self.stdin.lock().expect("stdin map poisoned");
            match stdin.remove(&id) {
                Some(StdinSlot::Ready(bytes)) => return Ok(bytes),
                Some(StdinSlot::Waiting(_)) | None => {
                    let (tx, rx) = oneshot::channel();
                    stdin.insert(id, StdinSlot::Waiting(tx));
                    rx
                }
            }
        };
        rx.await
            .map_err(|_| CommonError::internal("stdin channel closed before delivery").into())
    }

    fn deliver_stdin(&self, id: u64, bytes: Vec<u8>) {
        debug!(id, len = bytes.len(), "stdin bytes received");
        let mut stdin = self.stdin.lock().expect("stdin map poisoned");
        match stdin.remove(&id) {
            Some(StdinSlot::Waiting(tx)) => {
                let _ = tx.send(bytes);
            }
            _ => {
                stdin.insert(id, StdinSlot::Ready(bytes));
            }
        }
    }
}

async fn fetch_chunk(
    client: &RpcClient,
    req: ContentRequest,
) -> termite_store::Result<Bytes> {
    match client.call(Request::FileContent(req)).await {
        Ok(Response::FileContent(c)) => Ok(Bytes::from(c.chunk)),
        Ok(_) => Err(StoreError::Fetch("unexpected response variant".into())),
        Err(e) => Err(StoreError::Fetch(e.to_string())),
    }
}

/// Opens real mirror sessions over TCP.
struct MasterConnector {
    secret: Vec<u8>,
    coordinator: String,
    fs: Arc<FileServer>,
}

#[async_trait]
impl MirrorConnector for MasterConnector {
    async fn connect(&self, addr: &str, wanted_jobs: u32) -> Result<Arc<MirrorConnection>> {
        let key = format!("{:016x}", termite_proto::connection_id());

        let forward = dial_tcp(addr, &self.secret, RPC_CHANNEL, &key).await?;
        let client = Arc::new(RpcClient::new(forward));

        // The reverse channel: the worker pulls attributes and content of
        // the writable root through it. It must exist before CreateMirror,
        // which binds it to the session.
        let reverse = dial_tcp(addr, &self.secret, REVERSE_CHANNEL, &key).await?;
        let fs = Arc::clone(&self.fs);
        let reverse_task = tokio::spawn(async move {
            let _ = serve_connection(reverse, fs as Arc<dyn Service>).await;
        });

        let granted = match client
            .call(Request::CreateMirror {
                key: key.clone(),
                wanted_jobs,
            })
            .await
        {
            Ok(Response::MirrorCreated { granted_jobs }) => granted_jobs,
            Ok(_) => {
                reverse_task.abort();
                return Err(RpcError::UnexpectedResponse.into());
            }
            Err(e) => {
                reverse_task.abort();
                return Err(e.into());
            }
        };
        if granted == 0 {
            reverse_task.abort();
            return Err(CommonError::transport(format!("{addr}: no jobs granted")).into());
        }

        debug!(worker = %addr, granted, "mirror created");
        Ok(Arc::new(MirrorConnection::new(
            addr.to_owned(),
            key,
            client,
            granted,
            Some(reverse_task),
        )))
    }

    async fn list_workers(&self) -> Result<Vec<String>> {
        if self.coordinator.is_empty() {
            return Ok(Vec::new());
        }
        Ok(list_workers(&self.coordinator, &self.secret).await?)
    }
}

/// The service behind the local socket's control channel.
struct LocalService {
    master: Arc<Master>,
}

#[async_trait]
impl Service for LocalService {
    async fn handle(&self, request: Request) -> std::result::Result<Response, CommonError> {
        match request {
            Request::MasterRun(req) => {
                let resp = self.master.run(req).await.map_err(into_common)?;
                Ok(Response::Run(resp))
            }
            _ => Err(CommonError::policy("not a master request")),
        }
    }
}

fn into_common(err: MasterError) -> CommonError {
    match err {
        MasterError::Common(c) => c,
        other => CommonError::internal(other.to_string()),
    }
}
