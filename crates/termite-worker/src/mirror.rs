//! One mirror session, seen from the worker.
//!
//! The mirror holds the session's attribute cache (filled on demand through
//! the reverse channel to the master), materializes a private view per job,
//! runs the command, and harvests the produced files into a file set.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use filetime::FileTime;
use termite_attr::{AttributeCache, FileAttr, FileSet, Lookup};
use termite_proto::{
    AttrRequest, ContentRequest, Request, Response, RpcClient, RpcError, WorkRequest, WorkResponse,
};
use termite_store::{ContentStore, StoreError};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::view;

/// Worker-side state of one mirror session.
pub struct WorkerMirror {
    key: String,
    granted_jobs: u32,
    running: AtomicU32,
    attrs: AttributeCache,
    reverse: Arc<RpcClient>,
    store: Arc<ContentStore>,
    view_dir: PathBuf,
    next_job: AtomicU64,
    // Updates produced by finished jobs, waiting to ride the next response.
    pending: Mutex<Vec<FileAttr>>,
    fileset_id: AtomicU64,
}

impl WorkerMirror {
    pub fn new(
        key: String,
        granted_jobs: u32,
        reverse: Arc<RpcClient>,
        store: Arc<ContentStore>,
        view_dir: PathBuf,
    ) -> Result<Arc<Self>> {
        fs::create_dir_all(&view_dir)?;
        Ok(Arc::new(Self {
            key,
            granted_jobs,
            running: AtomicU32::new(0),
            attrs: AttributeCache::without_fetch(),
            reverse,
            store,
            view_dir,
            next_job: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
            fileset_id: AtomicU64::new(0),
        }))
    }

    /// The session key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Capacity granted to the master.
    #[must_use]
    pub fn granted_jobs(&self) -> u32 {
        self.granted_jobs
    }

    /// Jobs currently executing.
    #[must_use]
    pub fn running_jobs(&self) -> u32 {
        self.running.load(Ordering::Acquire)
    }

    /// Applies an update batch from the master.
    pub fn update_files(&self, files: &[FileAttr]) {
        trace!(mirror = %self.key, count = files.len(), "mirror update");
        self.attrs.update(files);
    }

    /// Runs one command in a fresh view and harvests its file set.
    pub async fn run_job(&self, req: &WorkRequest) -> Result<WorkResponse> {
        self.running.fetch_add(1, Ordering::AcqRel);
        let result = self.run_job_inner(req).await;
        self.running.fetch_sub(1, Ordering::AcqRel);
        result
    }

    async fn run_job_inner(&self, req: &WorkRequest) -> Result<WorkResponse> {
        let job_id = self.next_job.fetch_add(1, Ordering::AcqRel) + 1;
        let job_root = self.view_dir.join(format!("job-{job_id}"));
        fs::create_dir_all(&job_root)?;

        let result = self.run_in_view(&job_root, req, job_id).await;
        let _ = fs::remove_dir_all(&job_root);
        result
    }

    async fn run_in_view(
        &self,
        job_root: &Path,
        req: &WorkRequest,
        job_id: u64,
    ) -> Result<WorkResponse> {
        self.materialize(job_root, &req.dir).await?;
        let before = view::snapshot(job_root)?;

        let (exit, stdout, stderr) = exec(&job_root.join(&req.dir), req).await;
        debug!(mirror = %self.key, job = job_id, exit, "job finished");

        let produced = view::harvest(job_root, &before, &self.store)?;

        let (file_set, file_set_id) = {
            let mut pending = self.pending.lock().expect("mirror pending poisoned");
            pending.extend(produced);
            if pending.is_empty() {
                (None, self.fileset_id.load(Ordering::Acquire))
            } else {
                let files: Vec<FileAttr> = pending.drain(..).collect();
                let id = self.fileset_id.fetch_add(1, Ordering::AcqRel) + 1;
                (Some(FileSet::new(files)), id)
            }
        };
        if let Some(fset) = &file_set {
            // Later jobs on this mirror see these paths without a fetch.
            self.attrs.update(&fset.files);
        }

        Ok(WorkResponse {
            exit,
            stdout,
            stderr,
            file_set,
            file_set_id,
            task_ids: vec![job_id],
        })
    }

    /// Builds the view subtree the job will run in, pulling attributes and
    /// content from the master on demand.
    async fn materialize(&self, job_root: &Path, start: &str) -> Result<()> {
        fs::create_dir_all(job_root.join(start))?;

        let mut queue = vec![start.to_owned()];
        while let Some(path) = queue.pop() {
            let Some(attr) = self.ensure_attr(&path).await? else {
                continue;
            };
            let target = if path.is_empty() {
                job_root.to_path_buf()
            } else {
                job_root.join(&path)
            };

            if attr.is_dir() {
                fs::create_dir_all(&target)?;
                // Owner bits stay open so the job can write into its view.
                fs::set_permissions(
                    &target,
                    fs::Permissions::from_mode(attr.perm() | 0o700),
                )?;
                if let Some(entries) = &attr.entries {
                    for name in entries.keys() {
                        queue.push(if path.is_empty() {
                            name.clone()
                        } else {
                            format!("{path}/{name}")
                        });
                    }
                }
            } else if attr.is_regular() {
                let Some(digest) = attr.digest else { continue };
                if !self.store.has(&digest) {
                    let reverse = Arc::clone(&self.reverse);
                    self.store
                        .fetch_from_peer(
                            move |creq: ContentRequest| {
                                let reverse = Arc::clone(&reverse);
                                async move { fetch_chunk(&reverse, creq).await }
                            },
                            digest,
                        )
                        .await?;
                }
                fs::copy(self.store.path(&digest), &target)?;
                fs::set_permissions(&target, fs::Permissions::from_mode(attr.perm()))?;
                let mtime = FileTime::from_unix_time(
                    attr.mtime_ns.div_euclid(1_000_000_000),
                    attr.mtime_ns.rem_euclid(1_000_000_000) as u32,
                );
                filetime::set_file_mtime(&target, mtime)?;
            } else if attr.is_symlink() {
                if let Some(link) = &attr.link {
                    if fs::symlink_metadata(&target).is_ok() {
                        let _ = fs::remove_file(&target);
                    }
                    std::os::unix::fs::symlink(link, &target)?;
                }
            }
        }
        Ok(())
    }

    async fn ensure_attr(&self, path: &str) -> Result<Option<FileAttr>> {
        match self.attrs.lookup(path) {
            Lookup::Hit(attr) => Ok((!attr.is_deletion()).then_some(attr)),
            Lookup::Negative => Ok(None),
            Lookup::Miss => {
                let response = self
                    .reverse
                    .call(Request::GetAttr(AttrRequest {
                        path: path.to_owned(),
                    }))
                    .await?;
                let attr = match response {
                    Response::Attrs(r) => r.attrs.into_iter().find(|a| a.path == path),
                    _ => return Err(RpcError::UnexpectedResponse.into()),
                };
                self.attrs.insert(path, attr.clone());
                Ok(attr.filter(|a| !a.is_deletion()))
            }
        }
    }

    /// Closes the reverse channel and removes the view directory.
    pub fn close(&self) {
        self.reverse.close();
        if let Err(e) = fs::remove_dir_all(&self.view_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(mirror = %self.key, error = %e, "view cleanup failed");
            }
        }
    }
}

impl std::fmt::Debug for WorkerMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerMirror")
            .field("key", &self.key)
            .field("granted", &self.granted_jobs)
            .field("running", &self.running_jobs())
            .finish()
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

async fn exec(cwd: &Path, req: &WorkRequest) -> (i32, Vec<u8>, Vec<u8>) {
    let mut cmd = tokio::process::Command::new(&req.binary);
    if req.argv.len() > 1 {
        cmd.args(&req.argv[1..]);
    }
    cmd.env_clear();
    for kv in &req.env {
        if let Some((k, v)) = kv.split_once('=') {
            cmd.env(k, v);
        }
    }
    cmd.current_dir(cwd)
        .stdin(if req.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return (127, Vec::new(), format!("{}: {e}", req.binary).into_bytes());
        }
    };

    if let (Some(mut stdin), Some(bytes)) = (child.stdin.take(), req.stdin.clone()) {
        tokio::spawn(async move {
            let _ = stdin.write_all(&bytes).await;
            // Dropping the handle closes the pipe.
        });
    }

    match child.wait_with_output().await {
        Ok(output) => (
            output.status.code().unwrap_or(-1),
            output.stdout,
            output.stderr,
        ),
        Err(e) => (127, Vec::new(), e.to_string().into_bytes()),
    }
}
