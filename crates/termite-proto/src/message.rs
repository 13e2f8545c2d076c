//! Request and response records for every termite RPC.

use serde::{Deserialize, Serialize};
use termite_attr::{FileAttr, FileSet, FileSetId};

/// Chunk-range read against a peer's content store. Re-exported from the
/// store so both ends of a fetch speak the same record.
pub use termite_store::ChunkRequest as ContentRequest;

/// One chunk of blob content. A chunk shorter than the requested range
/// signals the end of the blob; at offset 0 a short chunk is the whole blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentResponse {
    pub chunk: Vec<u8>,
}

/// Attribute and content updates shipped to a mirror before it runs jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub files: Vec<FileAttr>,
}

/// Authoritative attribute lookup on the master's file server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttrRequest {
    pub path: String,
}

/// Answer to an [`AttrRequest`]; empty when the path does not exist or is
/// withheld by policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttrResponse {
    pub attrs: Vec<FileAttr>,
}

/// One command to execute remotely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Absolute path of the binary to run. Relative paths are rejected
    /// before dispatch.
    pub binary: String,
    pub argv: Vec<String>,
    /// Environment as `KEY=VALUE` strings.
    pub env: Vec<String>,
    /// Working directory, relative to the writable root.
    pub dir: String,
    /// Channel id of a previously-opened side channel carrying stdin bytes.
    pub stdin_id: Option<u64>,
    /// Stdin bytes, filled in by the master from the side channel before
    /// dispatch.
    pub stdin: Option<Vec<u8>>,
}

/// Result of one executed command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkResponse {
    pub exit: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Files the job produced; `None` means the master already knows the
    /// file set named by `file_set_id`.
    pub file_set: Option<FileSet>,
    pub file_set_id: FileSetId,
    /// Worker-side task identifiers, for diagnostics.
    pub task_ids: Vec<u64>,
}

/// One worker's registration with the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub address: String,
}

/// Status of one live mirror on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorStatus {
    pub key: String,
    pub granted_jobs: u32,
    pub running_jobs: u32,
}

/// Status report for a whole worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStatusResponse {
    pub mirrors: Vec<MirrorStatus>,
}

/// Every request this protocol can carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Master → worker: open a mirror session with the given capacity.
    CreateMirror { key: String, wanted_jobs: u32 },
    /// Master → worker: apply attribute/content updates to the mirror view.
    MirrorUpdate(UpdateRequest),
    /// Master → worker: execute one command.
    MirrorRun(WorkRequest),
    /// Either direction: stream one chunk range from the peer's store.
    FileContent(ContentRequest),
    /// Worker → master (reverse channel): authoritative attribute lookup.
    GetAttr(AttrRequest),
    /// Client → master (local socket): run a command somewhere.
    MasterRun(WorkRequest),
    /// Worker → coordinator: periodic liveness registration.
    CoordinatorRegister(Registration),
    /// Master → coordinator: list currently-registered workers.
    CoordinatorList,
    /// Operator → worker: report live mirrors.
    WorkerStatus,
}

/// Every response this protocol can carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Generic acknowledgement for requests with no payload.
    Ok,
    /// Mirror session opened with the granted capacity.
    MirrorCreated { granted_jobs: u32 },
    FileContent(ContentResponse),
    Attrs(AttrResponse),
    Run(WorkResponse),
    Registered { registrations: Vec<Registration> },
    WorkerStatus(WorkerStatusResponse),
}
