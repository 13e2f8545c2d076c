//! One long-lived session between the master and a worker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use termite_attr::{FileAttr, FileSet, FileSetId};
use termite_proto::{Request, Response, RpcClient, RpcError, UpdateRequest, WorkRequest, WorkResponse};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::waiter::FileSetWaiter;

pub(crate) struct Slots {
    pub max_jobs: u32,
    // Goes negative under oversubscription; only positive slots count as
    // available capacity.
    pub available: i64,
}

/// A mirror session: forward RPC channel, reverse file-server channel, a
/// pending-change queue, and the per-mirror file-set waiter.
pub struct MirrorConnection {
    worker_addr: String,
    key: String,
    client: std::sync::Arc<RpcClient>,
    /// Rendezvous for jobs in flight on this mirror.
    pub waiter: FileSetWaiter,
    pub(crate) slots: Mutex<Slots>,
    pending: Mutex<Vec<FileAttr>>,
    last_replayed: AtomicU64,
    reverse_task: Mutex<Option<JoinHandle<()>>>,
}

impl MirrorConnection {
    #[must_use]
    pub fn new(
        worker_addr: String,
        key: String,
        client: std::sync::Arc<RpcClient>,
        granted_jobs: u32,
        reverse_task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            worker_addr,
            key,
            client,
            waiter: FileSetWaiter::new(),
            slots: Mutex::new(Slots {
                max_jobs: granted_jobs,
                available: i64::from(granted_jobs),
            }),
            pending: Mutex::new(Vec::new()),
            last_replayed: AtomicU64::new(0),
            reverse_task: Mutex::new(reverse_task),
        }
    }

    /// The worker address, the session's identity in the pool.
    #[must_use]
    pub fn worker_addr(&self) -> &str {
        &self.worker_addr
    }

    /// Session key tying the reverse channel to this mirror.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The forward RPC channel.
    #[must_use]
    pub fn client(&self) -> &std::sync::Arc<RpcClient> {
        &self.client
    }

    /// Capacity granted by the worker.
    #[must_use]
    pub fn max_jobs(&self) -> u32 {
        self.slots.lock().expect("mirror slots poisoned").max_jobs
    }

    /// Free slots, never negative.
    #[must_use]
    pub fn available_jobs(&self) -> u32 {
        let slots = self.slots.lock().expect("mirror slots poisoned");
        slots.available.max(0) as u32
    }

    /// Highest file-set id this master has replayed from this mirror.
    #[must_use]
    pub fn last_replayed(&self) -> FileSetId {
        self.last_replayed.load(Ordering::Acquire)
    }

    pub(crate) fn note_replayed(&self, id: FileSetId) {
        self.last_replayed.fetch_max(id, Ordering::AcqRel);
    }

    /// Appends file updates to ship before the next job runs here.
    pub fn queue_files(&self, fset: &FileSet) {
        let mut pending = self.pending.lock().expect("mirror pending poisoned");
        pending.extend(fset.files.iter().cloned());
    }

    /// Number of queued, unshipped file updates.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("mirror pending poisoned").len()
    }

    /// Ships the pending queue as a single update, clearing it on success.
    ///
    /// Must run before any job is dispatched on this mirror so the worker
    /// sees the view the master held at pick time.
    pub async fn send_files(&self) -> Result<()> {
        let files = {
            let pending = self.pending.lock().expect("mirror pending poisoned");
            if pending.is_empty() {
                return Ok(());
            }
            pending.clone()
        };

        match self
            .client
            .call(Request::MirrorUpdate(UpdateRequest {
                files: files.clone(),
            }))
            .await
        {
            Ok(Response::Ok) => {}
            Ok(_) => return Err(RpcError::UnexpectedResponse.into()),
            Err(e) => {
                warn!(worker = %self.worker_addr, error = %e, "mirror update failed");
                return Err(e.into());
            }
        }
        debug!(worker = %self.worker_addr, count = files.len(), "sent pending changes");

        // Entries queued while the update was in flight stay queued.
        let mut pending = self.pending.lock().expect("mirror pending poisoned");
        let drain_count = files.len().min(pending.len());
        pending.drain(..drain_count);
        Ok(())
    }

    /// Executes one command on the worker.
    pub async fn run(&self, req: WorkRequest) -> Result<WorkResponse> {
        match self.client.call(Request::MirrorRun(req)).await {
            Ok(Response::Run(resp)) => Ok(resp),
            Ok(_) => Err(RpcError::UnexpectedResponse.into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Closes both channels. Safe to call more than once.
    pub fn close(&self) {
        self.client.close();
        if let Some(task) = self
            .reverse_task
            .lock()
            .expect("mirror reverse poisoned")
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for MirrorConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MirrorConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.lock().expect("mirror slots poisoned");
        f.debug_struct("MirrorConnection")
            .field("worker", &self.worker_addr)
            .field("max_jobs", &slots.max_jobs)
            .field("available", &slots.available)
            .field("pending", &self.pending_len())
            .finish()
    }
}
