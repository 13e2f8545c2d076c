//! The mirror pool: worker discovery, connection lifecycle, job admission,
//! and keepalive reaping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use termite_attr::FileSet;
use termite_error::CommonError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::mirror::MirrorConnection;

/// Opens mirror sessions and discovers workers. Abstracted so the pool's
/// admission logic is independent of the transport.
#[async_trait]
pub trait MirrorConnector: Send + Sync + 'static {
    /// Creates a mirror on the given worker with the wanted capacity.
    async fn connect(&self, addr: &str, wanted_jobs: u32) -> Result<Arc<MirrorConnection>>;

    /// Fetches the current worker set from the coordinator.
    async fn list_workers(&self) -> Result<Vec<String>>;
}

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Total job slots wanted across all workers.
    pub wanted_max_jobs: u32,
    /// Idle window after which all mirrors are dropped.
    pub keep_alive: Duration,
    /// Housekeeping period.
    pub period: Duration,
}

struct PoolState {
    // Address -> currently usable. A failed connect blacklists the address
    // until the next coordinator refresh replaces the map.
    workers: HashMap<String, bool>,
    mirrors: HashMap<String, Arc<MirrorConnection>>,
    last_action: Instant,
    jobs_dispatched: u64,
}

/// The master-side manager of all mirrors.
pub struct MirrorPool {
    connector: Arc<dyn MirrorConnector>,
    options: PoolOptions,
    state: tokio::sync::Mutex<PoolState>,
    housekeeper: Mutex<Option<JoinHandle<()>>>,
}

impl MirrorPool {
    #[must_use]
    pub fn new(connector: Arc<dyn MirrorConnector>, options: PoolOptions) -> Arc<Self> {
        Arc::new(Self {
            connector,
            options,
            state: tokio::sync::Mutex::new(PoolState {
                workers: HashMap::new(),
                mirrors: HashMap::new(),
                last_action: Instant::now(),
                jobs_dispatched: 0,
            }),
            housekeeper: Mutex::new(None),
        })
    }

    /// Starts the periodic refresh-and-reap loop.
    pub fn start_housekeeping(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let period = self.options.period;
        let handle = tokio::spawn(async move {
            loop {
                pool.refresh_workers().await;
                pool.maybe_drop_connections().await;
                tokio::time::sleep(period).await;
            }
        });
        *self.housekeeper.lock().expect("pool housekeeper poisoned") = Some(handle);
    }

    /// Stops housekeeping and closes every mirror.
    pub async fn shutdown(&self) {
        if let Some(handle) = self
            .housekeeper
            .lock()
            .expect("pool housekeeper poisoned")
            .take()
        {
            handle.abort();
        }
        self.drop_connections().await;
    }

    /// Picks a mirror to run a job on, connecting to a new worker first if
    /// no capacity is free. Returns the no-workers error when nothing can
    /// be reached; the caller is expected to fall back to local execution.
    pub async fn pick(&self) -> Result<Arc<MirrorConnection>> {
        let mut state = self.state.lock().await;

        if total_available(&state) == 0 {
            if state.workers.is_empty() {
                // The lock is never held across a network call.
                drop(state);
                let fetched = self.fetch_worker_map().await;
                state = self.state.lock().await;
                if state.workers.is_empty() {
                    state.workers = fetched;
                }
            }

            let wanted = self
                .options
                .wanted_max_jobs
                .saturating_sub(total_max(&state));
            if wanted > 0 {
                state = self.try_connect(state, wanted).await;
            }

            if total_max(&state) == 0 {
                return Err(CommonError::NoWorkers.into());
            }
        }

        // Prefer any mirror with a free slot; when all are full,
        // oversubscribe a uniformly random one.
        let mirror = {
            let with_slot = state.mirrors.values().find(|m| m.available_jobs() > 0);
            match with_slot {
                Some(m) => Arc::clone(m),
                None => {
                    let nth = rand::thread_rng().gen_range(0..state.mirrors.len());
                    Arc::clone(state.mirrors.values().nth(nth).expect("nonempty mirrors"))
                }
            }
        };
        mirror.slots.lock().expect("mirror slots poisoned").available -= 1;
        state.jobs_dispatched += 1;
        Ok(mirror)
    }

    /// Credits a finished job back to its mirror.
    pub async fn job_done(&self, mirror: &Arc<MirrorConnection>) {
        let mut state = self.state.lock().await;
        state.last_action = Instant::now();
        mirror.slots.lock().expect("mirror slots poisoned").available += 1;
    }

    /// Drops a mirror after an error: closes both channels, removes it from
    /// the pool, and blacklists the address until the next refresh.
    /// Idempotent.
    pub async fn drop_mirror(
        &self,
        mirror: &Arc<MirrorConnection>,
        reason: &(dyn std::fmt::Display + Send + Sync),
    ) {
        warn!(worker = %mirror.worker_addr(), %reason, "dropping mirror");
        {
            let mut state = self.state.lock().await;
            state.mirrors.remove(mirror.worker_addr());
            state.workers.insert(mirror.worker_addr().to_owned(), false);
        }
        mirror.close();
    }

    /// Queues a file set to every mirror except its origin.
    pub async fn queue_files(&self, origin: Option<&str>, fset: &FileSet) {
        if fset.is_empty() {
            return;
        }
        let state = self.state.lock().await;
        for (addr, mirror) in &state.mirrors {
            if Some(addr.as_str()) != origin {
                mirror.queue_files(fset);
            }
        }
    }

    /// Replaces the worker map from the coordinator. An empty answer keeps
    /// the old map, blacklist included.
    pub async fn refresh_workers(&self) {
        let fetched = self.fetch_worker_map().await;
        if fetched.is_empty() {
            debug!("coordinator has no workers for us");
            return;
        }
        let mut state = self.state.lock().await;
        state.workers = fetched;
    }

    /// Closes every mirror when the pool has been fully idle for the
    /// keepalive window. Workers are expensive to keep warm on idle
    /// machines.
    pub async fn maybe_drop_connections(&self) {
        let mut state = self.state.lock().await;
        if state.mirrors.is_empty() {
            return;
        }
        if total_available(&state) < total_max(&state) {
            // Something is running.
            return;
        }
        if state.last_action.elapsed() < self.options.keep_alive {
            return;
        }
        info!("master inactive too long, dropping connections");
        drop_all(&mut state);
    }

    /// Unconditionally closes every mirror and resets stats.
    pub async fn drop_connections(&self) {
        let mut state = self.state.lock().await;
        drop_all(&mut state);
    }

    /// Sum of granted capacity across live mirrors.
    pub async fn total_max_jobs(&self) -> u32 {
        total_max(&*self.state.lock().await)
    }

    /// Number of live mirrors.
    pub async fn mirror_count(&self) -> usize {
        self.state.lock().await.mirrors.len()
    }

    async fn fetch_worker_map(&self) -> HashMap<String, bool> {
        match self.connector.list_workers().await {
            Ok(addrs) => addrs.into_iter().map(|a| (a, true)).collect(),
            Err(e) => {
                warn!(error = %e, "worker discovery failed");
                HashMap::new()
            }
        }
    }

    // Connects to at most one new worker. Takes the state guard, releases
    // it around the network calls, and returns it re-acquired.
    async fn try_connect<'a>(
        &'a self,
        state: tokio::sync::MutexGuard<'a, PoolState>,
        wanted: u32,
    ) -> tokio::sync::MutexGuard<'a, PoolState> {
        let candidates: Vec<String> = state
            .workers
            .iter()
            .filter(|(addr, usable)| **usable && !state.mirrors.contains_key(*addr))
            .map(|(addr, _)| addr.clone())
            .collect();
        drop(state);

        let mut connected = None;
        let mut blacklist = Vec::new();
        for addr in candidates {
            debug!(worker = %addr, wanted, "creating mirror");
            match self.connector.connect(&addr, wanted).await {
                Ok(mirror) => {
                    connected = Some((addr, mirror));
                    break;
                }
                Err(e) => {
                    warn!(worker = %addr, error = %e, "nonfatal error creating mirror");
                    blacklist.push(addr);
                }
            }
        }

        let mut state = self.state.lock().await;
        for addr in blacklist {
            state.workers.insert(addr, false);
        }
        if let Some((addr, mirror)) = connected {
            state.mirrors.insert(addr, mirror);
        }
        state
    }
}

fn total_available(state: &PoolState) -> u32 {
    state.mirrors.values().map(|m| m.available_jobs()).sum()
}

fn total_max(state: &PoolState) -> u32 {
    state.mirrors.values().map(|m| m.max_jobs()).sum()
}

fn drop_all(state: &mut PoolState) {
    for mirror in state.mirrors.values() {
        mirror.close();
    }
    if !state.mirrors.is_empty() {
        debug!(
            mirrors = state.mirrors.len(),
            jobs = state.jobs_dispatched,
            "closed all mirrors"
        );
    }
    state.mirrors.clear();
    state.jobs_dispatched = 0;
}

impl std::fmt::Debug for MirrorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorPool")
            .field("wanted_max_jobs", &self.options.wanted_max_jobs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MasterError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use termite_error::CommonError;
    use termite_proto::{Request, Response, RpcClient, Service};

    struct StubWorker;

    #[async_trait]
    impl Service for StubWorker {
        async fn handle(&self, request: Request) -> std::result::Result<Response, CommonError> {
            match request {
                Request::MirrorUpdate(_) => Ok(Response::Ok),
                _ => Err(CommonError::policy("stub")),
            }
        }
    }

    /// Connector that hands out in-process mirrors over duplex pipes.
    struct FakeConnector {
        workers: Vec<String>,
        granted: u32,
        connects: AtomicU32,
        fail_connect: bool,
    }

    impl FakeConnector {
        fn new(workers: &[&str], granted: u32) -> Arc<Self> {
            Arc::new(Self {
                workers: workers.iter().map(|s| (*s).to_owned()).collect(),
                granted,
                connects: AtomicU32::new(0),
                fail_connect: false,
            })
        }
    }

    #[async_trait]
    impl MirrorConnector for FakeConnector {
        async fn connect(&self, addr: &str, wanted: u32) -> Result<Arc<MirrorConnection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect {
                return Err(MasterError::Common(CommonError::transport("refused")));
            }
            let (client_side, server_side) = tokio::io::duplex(64 * 1024);
            tokio::spawn(termite_proto::serve_connection(
                server_side,
                Arc::new(StubWorker) as Arc<dyn Service>,
            ));
            Ok(Arc::new(MirrorConnection::new(
                addr.to_owned(),
                "test-key".to_owned(),
                Arc::new(RpcClient::new(client_side)),
                wanted.min(self.granted),
                None,
            )))
        }

        async fn list_workers(&self) -> Result<Vec<String>> {
            Ok(self.workers.clone())
        }
    }

    fn pool_options(keep_alive: Duration) -> PoolOptions {
        PoolOptions {
            wanted_max_jobs: 2,
            keep_alive,
            period: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_pick_with_no_workers() {
        let connector = FakeConnector::new(&[], 1);
        let pool = MirrorPool::new(connector, pool_options(Duration::from_secs(60)));

        let err = pool.pick().await.unwrap_err();
        assert!(err.is_no_workers());
    }

    #[tokio::test]
    async fn test_pick_connects_and_admits() {
        let connector = FakeConnector::new(&["w1:1"], 2);
        let pool = MirrorPool::new(connector, pool_options(Duration::from_secs(60)));

        let mirror = pool.pick().await.unwrap();
        assert_eq!(mirror.worker_addr(), "w1:1");
        assert_eq!(mirror.max_jobs(), 2);
        assert_eq!(mirror.available_jobs(), 1);
        assert_eq!(pool.mirror_count().await, 1);

        pool.job_done(&mirror).await;
        assert_eq!(mirror.available_jobs(), 2);
    }

    #[tokio::test]
    async fn test_oversubscription_when_full() {
        let connector = FakeConnector::new(&["w1:1"], 1);
        let pool = MirrorPool::new(
            connector,
            PoolOptions {
                wanted_max_jobs: 1,
                keep_alive: Duration::from_secs(60),
                period: Duration::from_millis(50),
            },
        );

        let first = pool.pick().await.unwrap();
        assert_eq!(first.available_jobs(), 0);

        // All full: the pick oversubscribes rather than blocking.
        let second = pool.pick().await.unwrap();
        assert_eq!(second.worker_addr(), "w1:1");
        assert_eq!(second.available_jobs(), 0);

        pool.job_done(&second).await;
        pool.job_done(&first).await;
        assert_eq!(first.available_jobs(), 1);
    }

    #[tokio::test]
    async fn test_drop_blacklists_until_refresh() {
        let connector = FakeConnector::new(&["w1:1"], 1);
        let pool = MirrorPool::new(Arc::clone(&connector) as Arc<dyn MirrorConnector>, pool_options(Duration::from_secs(60)));

        let mirror = pool.pick().await.unwrap();
        pool.drop_mirror(&mirror, &"test failure").await;
        assert_eq!(pool.mirror_count().await, 0);

        // The address is blacklisted, so nothing to connect to.
        let err = pool.pick().await.unwrap_err();
        assert!(err.is_no_workers());

        // A coordinator refresh clears the blacklist.
        pool.refresh_workers().await;
        let mirror = pool.pick().await.unwrap();
        assert_eq!(mirror.worker_addr(), "w1:1");
    }

    #[tokio::test]
    async fn test_drop_mirror_is_idempotent() {
        let connector = FakeConnector::new(&["w1:1"], 1);
        let pool = MirrorPool::new(connector, pool_options(Duration::from_secs(60)));

        let mirror = pool.pick().await.unwrap();
        pool.drop_mirror(&mirror, &"first").await;
        pool.drop_mirror(&mirror, &"second").await;
        assert_eq!(pool.mirror_count().await, 0);
    }

    #[tokio::test]
    async fn test_idle_reap() {
        let connector = FakeConnector::new(&["w1:1"], 1);
        let pool = MirrorPool::new(connector, pool_options(Duration::from_millis(40)));

        let mirror = pool.pick().await.unwrap();
        pool.job_done(&mirror).await;

        // Busy pools and fresh pools are left alone.
        pool.maybe_drop_connections().await;
        assert_eq!(pool.mirror_count().await, 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        pool.maybe_drop_connections().await;
        assert_eq!(pool.mirror_count().await, 0);
        assert_eq!(pool.total_max_jobs().await, 0);
    }

    #[tokio::test]
    async fn test_busy_pool_is_not_reaped() {
        let connector = FakeConnector::new(&["w1:1"], 1);
        let pool = MirrorPool::new(connector, pool_options(Duration::from_millis(40)));

        let _mirror = pool.pick().await.unwrap();
        // The job never completes; the mirror must survive the window.
        tokio::time::sleep(Duration::from_millis(60)).await;
        pool.maybe_drop_connections().await;
        assert_eq!(pool.mirror_count().await, 1);
    }

    #[tokio::test]
    async fn test_queue_files_skips_origin() {
        let connector = FakeConnector::new(&["w1:1", "w2:2"], 1);
        let pool = MirrorPool::new(
            connector,
            PoolOptions {
                wanted_max_jobs: 2,
                keep_alive: Duration::from_secs(60),
                period: Duration::from_millis(50),
            },
        );

        let first = pool.pick().await.unwrap();
        let second = pool.pick().await.unwrap();
        assert_ne!(first.worker_addr(), second.worker_addr());

        let fset = FileSet::new(vec![termite_attr::FileAttr::directory("a/b/c", 0o755)]);
        pool.queue_files(Some(first.worker_addr()), &fset).await;

        assert_eq!(first.pending_len(), 0);
        assert_eq!(second.pending_len(), 1);
    }
}
