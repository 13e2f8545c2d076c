//! Test harness: a coordinator, one or more workers, and a master wired
//! together in one process over real sockets.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tempfile::TempDir;
use termite_coordinator::{Coordinator, CoordinatorOptions};
use termite_master::{Master, MasterOptions};
use termite_proto::{
    dial_unix, Request, Response, RpcClient, WorkRequest, WorkResponse, RPC_CHANNEL,
};
use termite_store::StoreOptions;
use termite_worker::{Worker, WorkerOptions};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UnixListener};

const SECRET: &str = "e2e-shared-secret";

/// Harness tuning knobs.
pub struct TestConfig {
    pub workers: usize,
    pub max_jobs: u32,
    pub keep_alive_ms: u64,
    pub period_ms: u64,
    pub expose_private: bool,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            max_jobs: 1,
            keep_alive_ms: 60_000,
            period_ms: 500,
            expose_private: true,
        }
    }
}

/// One running master + workers + coordinator.
pub struct TestCase {
    pub tmp: TempDir,
    pub wd: PathBuf,
    pub socket: PathBuf,
    pub master: Arc<Master>,
    pub workers: Vec<Arc<Worker>>,
    pub coordinator: Arc<Coordinator>,
}

impl TestCase {
    pub async fn new(config: TestConfig) -> Result<Self> {
        let tmp = TempDir::new()?;
        let wd = tmp.path().join("wd");
        std::fs::create_dir_all(&wd)?;

        // Coordinator.
        let coordinator = Coordinator::new(CoordinatorOptions {
            secret: SECRET.as_bytes().to_vec(),
            liveness_window: Duration::from_secs(60),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let coordinator_addr = listener.local_addr()?.to_string();
        tokio::spawn(Arc::clone(&coordinator).serve(listener));

        // Workers.
        let mut workers = Vec::new();
        for i in 0..config.workers {
            let options = WorkerOptions {
                secret: SECRET.to_owned(),
                temp_dir: tmp.path().join(format!("worker-{i}-tmp")),
                jobs: 1,
                report_interval_ms: 100,
                coordinator: coordinator_addr.clone(),
                store: StoreOptions {
                    dir: tmp.path().join(format!("worker-{i}-cache")),
                    ..Default::default()
                },
                ..Default::default()
            };
            let worker = Worker::new(options)?;
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let addr = listener.local_addr()?.to_string();
            let serving = Arc::clone(&worker);
            tokio::spawn(async move { serving.serve(listener).await });
            worker.start_reporting(addr);
            workers.push(worker);
        }

        // Master. The socket lives outside the writable root so job views
        // never see it.
        let socket = tmp.path().join("master-socket");
        let options = MasterOptions {
            writable_root: wd.clone(),
            coordinator: coordinator_addr,
            retry_count: 2,
            secret: SECRET.to_owned(),
            max_jobs: config.max_jobs,
            keep_alive_ms: config.keep_alive_ms,
            period_ms: config.period_ms,
            expose_private: config.expose_private,
            socket: socket.clone(),
            store: StoreOptions {
                dir: tmp.path().join("master-cache"),
                ..Default::default()
            },
        };
        let master = Master::new(options)?;
        let listener = UnixListener::bind(&socket)?;
        let serving = Arc::clone(&master);
        tokio::spawn(async move { serving.serve(listener).await });

        // Wait for worker registration to land.
        for _ in 0..40 {
            if coordinator.worker_count() >= config.workers {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if coordinator.worker_count() < config.workers {
            bail!("workers never registered");
        }

        Ok(Self {
            tmp,
            wd,
            socket,
            master,
            workers,
            coordinator,
        })
    }

    /// Issues one run through the master's local socket, the way the wrapper
    /// CLI would.
    pub async fn run(&self, mut req: WorkRequest) -> Result<WorkResponse> {
        if req.env.is_empty() {
            req.env = test_env();
        }
        if req.binary.is_empty() {
            req.binary = find_bin(&req.argv[0])?;
        }

        let stream = dial_unix(&self.socket, SECRET.as_bytes(), RPC_CHANNEL, "").await?;
        let client = RpcClient::new(stream);
        let response = client.call(Request::MasterRun(req)).await;
        client.close();
        match response? {
            Response::Run(resp) => Ok(resp),
            other => bail!("unexpected response: {other:?}"),
        }
    }

    /// Runs and asserts exit status 0.
    pub async fn run_success(&self, req: WorkRequest) -> WorkResponse {
        let resp = self.run(req).await.expect("run failed in transport");
        assert_eq!(
            resp.exit,
            0,
            "expected success, stderr: {}",
            String::from_utf8_lossy(&resp.stderr)
        );
        resp
    }

    /// Runs and asserts exit status != 0.
    pub async fn run_fail(&self, req: WorkRequest) -> WorkResponse {
        let resp = self.run(req).await.expect("run failed in transport");
        assert_ne!(resp.exit, 0, "expected failure, got success");
        resp
    }

    /// Opens a stdin side channel and feeds it `bytes`.
    pub async fn send_stdin(&self, channel: u64, bytes: &[u8]) -> Result<()> {
        let mut stream = dial_unix(&self.socket, SECRET.as_bytes(), channel, "").await?;
        stream.write_all(bytes).await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Drops every mirror and shuts the master down.
    pub async fn clean(&self) {
        self.master.shutdown().await;
    }
}

/// A minimal, deterministic environment for jobs.
pub fn test_env() -> Vec<String> {
    vec!["PATH=/bin:/usr/bin".to_owned(), "USER=nobody".to_owned()]
}

/// Resolves a binary name on the usual system paths.
pub fn find_bin(name: &str) -> Result<String> {
    for dir in ["/bin", "/usr/bin"] {
        let candidate = Path::new(dir).join(name);
        if candidate.exists() {
            let resolved = std::fs::canonicalize(&candidate)?;
            return Ok(resolved.to_string_lossy().into_owned());
        }
    }
    bail!("binary {name} not found")
}

/// Convenience constructor for argv-only requests.
pub fn work_request(argv: &[&str]) -> WorkRequest {
    WorkRequest {
        argv: argv.iter().map(|s| (*s).to_owned()).collect(),
        dir: String::new(),
        ..Default::default()
    }
}
