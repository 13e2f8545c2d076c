//! Content-addressed store: sharded disk layout plus a bounded memory LRU.

use std::collections::HashSet;
use std::fs;
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};

use bytes::Bytes;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tempfile::NamedTempFile;
use termite_attr::Digest;
use tracing::{debug, trace, warn};

use crate::error::{Result, StoreError};

/// Blobs below this size take the in-memory path and are admitted to the
/// LRU; larger blobs stream straight to disk. A tunable, not a contract.
pub const MEMORY_LIMIT: usize = 128 * 1024;

/// Chunk size for peer-to-peer content fetches.
pub const CHUNK_SIZE: usize = 256 * 1024;

const COPY_BUF: usize = 32 * 1024;

/// One range request against a peer's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub digest: Digest,
    pub start: u64,
    pub end: u64,
}

/// Content store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Root directory for the sharded blob layout.
    pub dir: PathBuf,
    /// Maximum number of blobs kept in the memory LRU; 0 disables it.
    pub memory_cache_entries: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::new(),
            memory_cache_entries: 1024,
        }
    }
}

struct State {
    have: HashSet<Digest>,
    faulting: HashSet<Digest>,
    memory: Option<LruCache<Digest, Bytes>>,
    memory_hits: u64,
    memory_tries: u64,
}

/// Content-addressed blob store.
///
/// Blobs live at `<root>/<hex[0..2]>/<hex[2..]>` with mode `0444`. The
/// in-memory `have` set is rebuilt from a directory scan at construction.
/// All membership and LRU mutations are serialised under one lock; disk I/O
/// runs with the lock released, and presence flips to true only after the
/// rename into the sharded location completes.
pub struct ContentStore {
    dir: PathBuf,
    state: Mutex<State>,
    cond: Condvar,
}

impl ContentStore {
    /// Opens a store rooted at `options.dir`, creating the directory and
    /// scanning any blobs already on disk.
    pub fn new(options: &StoreOptions) -> Result<Self> {
        fs::create_dir_all(&options.dir)?;
        let have = read_hex_database(&options.dir)?;
        debug!(dir = %options.dir.display(), blobs = have.len(), "content store opened");

        let memory = NonZeroUsize::new(options.memory_cache_entries).map(LruCache::new);
        Ok(Self {
            dir: options.dir.clone(),
            state: Mutex::new(State {
                have,
                faulting: HashSet::new(),
                memory,
                memory_hits: 0,
                memory_tries: 0,
            }),
            cond: Condvar::new(),
        })
    }

    /// Resizes the memory cache; `file_count == 0` disables it.
    pub fn set_memory_cache_size(&self, file_count: usize) {
        let mut state = self.lock();
        state.memory = NonZeroUsize::new(file_count).map(LruCache::new);
    }

    /// Fraction of memory lookups that hit, in `[0, 1]`.
    #[must_use]
    pub fn memory_hit_rate(&self) -> f64 {
        let state = self.lock();
        if state.memory_tries == 0 {
            return 0.0;
        }
        state.memory_hits as f64 / state.memory_tries as f64
    }

    /// Membership in the `have` set.
    #[must_use]
    pub fn has(&self, digest: &Digest) -> bool {
        self.lock().have.contains(digest)
    }

    /// On-disk location of a blob under the two-level sharded layout.
    #[must_use]
    pub fn path(&self, digest: &Digest) -> PathBuf {
        hash_path(&self.dir, digest)
    }

    /// Memory-only peek. Waits for an in-progress fault of the same digest
    /// to finish, then returns what the LRU holds, if anything.
    #[must_use]
    pub fn contents_if_loaded(&self, digest: &Digest) -> Option<Bytes> {
        let mut state = self.lock();
        while state.faulting.contains(digest) {
            state = self.cond.wait(state).expect("store lock poisoned");
        }
        state.memory_tries += 1;
        let hit = state.memory.as_mut().and_then(|m| m.get(digest).cloned());
        if hit.is_some() {
            state.memory_hits += 1;
        }
        hit
    }

    /// Saves a blob held in memory. Hashes while writing, renames atomically
    /// into the sharded location, and admits blobs below [`MEMORY_LIMIT`]
    /// to the LRU.
    pub fn save(&self, content: &[u8]) -> Result<Digest> {
        let digest = Digest::of(content);
        if self.has(&digest) {
            self.admit_to_memory(digest, content);
            return Ok(digest);
        }

        let mut writer = BlobWriter::new(&self.dir)?;
        writer.write_all(content)?;
        let saved = writer.finish(&self.dir)?;
        trace!(digest = %saved, size = content.len(), "saved blob");

        let mut state = self.lock();
        state.have.insert(saved);
        if content.len() < MEMORY_LIMIT {
            if let Some(memory) = state.memory.as_mut() {
                memory.put(saved, Bytes::copy_from_slice(content));
            }
        }
        Ok(saved)
    }

    /// Saves a blob from a reader. Blobs below [`MEMORY_LIMIT`] are buffered
    /// and routed through [`save`]; larger blobs stream-hash to disk.
    ///
    /// [`save`]: ContentStore::save
    pub fn save_stream<R: Read>(&self, input: &mut R, size: u64) -> Result<Digest> {
        if (size as usize) < MEMORY_LIMIT {
            let mut buf = Vec::with_capacity(size as usize);
            input.take(size).read_to_end(&mut buf)?;
            if buf.len() as u64 != size {
                return Err(StoreError::ShortRead {
                    got: buf.len() as u64,
                    want: size,
                });
            }
            return self.save(&buf);
        }

        let mut writer = BlobWriter::new(&self.dir)?;
        let mut remaining = size;
        let mut buf = [0u8; COPY_BUF];
        while remaining > 0 {
            let want = remaining.min(COPY_BUF as u64) as usize;
            let n = input.read(&mut buf[..want])?;
            if n == 0 {
                return Err(StoreError::ShortRead {
                    got: size - remaining,
                    want: size,
                });
            }
            writer.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        let saved = writer.finish(&self.dir)?;

        self.lock().have.insert(saved);
        Ok(saved)
    }

    /// Saves the contents of an existing file without disturbing it.
    pub fn save_path(&self, path: &Path) -> Result<Digest> {
        let mut f = fs::File::open(path)?;
        let size = f.metadata()?.len();
        self.save_stream(&mut f, size)
    }

    /// Moves an existing file into the store.
    ///
    /// The file's stat is captured before hashing and verified after the
    /// rename; any drift in size or mtime means a concurrent writer touched
    /// it and the blob would be mislabelled.
    pub fn destructive_save_path(&self, path: &Path) -> Result<Digest> {
        let before = fs::metadata(path)?;
        let before_mtime = before.modified()?;

        let mut content = None;
        let digest = if (before.len() as usize) < MEMORY_LIMIT {
            let buf = fs::read(path)?;
            let d = Digest::of(&buf);
            content = Some(buf);
            d
        } else {
            let mut hasher = Sha256::new();
            let mut f = fs::File::open(path)?;
            let mut buf = [0u8; COPY_BUF];
            loop {
                let n = f.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Digest::from_bytes(hasher.finalize().into())
        };

        if self.has(&digest) {
            fs::remove_file(path)?;
            return Ok(digest);
        }

        let dest = self.path(&digest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(path, &dest)
            .map_err(|e| StoreError::Rename(format!("{} -> {}: {e}", path.display(), dest.display())))?;
        fs::set_permissions(&dest, fs::Permissions::from_mode(0o444))?;

        let after = fs::metadata(&dest)?;
        if after.len() != before.len() || after.modified()? != before_mtime {
            return Err(StoreError::StatDrift(path.display().to_string()));
        }

        let mut state = self.lock();
        state.have.insert(digest);
        if let (Some(buf), Some(memory)) = (content, state.memory.as_mut()) {
            memory.put(digest, Bytes::from(buf));
        }
        Ok(digest)
    }

    /// Loads a blob from disk into the memory LRU.
    ///
    /// Single-flight: concurrent callers for the same digest coalesce onto
    /// one reader and are all released when it completes.
    pub fn fault_in(&self, digest: &Digest) -> Result<()> {
        let mut state = self.lock();
        if state.memory.is_none() {
            return Ok(());
        }
        loop {
            if state
                .memory
                .as_ref()
                .is_some_and(|m| m.contains(digest))
            {
                return Ok(());
            }
            if state.faulting.contains(digest) {
                state = self.cond.wait(state).expect("store lock poisoned");
            } else {
                break;
            }
        }

        state.faulting.insert(*digest);
        drop(state);

        let read = fs::read(self.path(digest));

        let mut state = self.lock();
        state.faulting.remove(digest);
        self.cond.notify_all();
        match read {
            Ok(buf) => {
                if let Some(memory) = state.memory.as_mut() {
                    memory.put(*digest, Bytes::from(buf));
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(*digest))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Pulls a blob from a remote store in [`CHUNK_SIZE`] ranges.
    ///
    /// A short first chunk at offset 0 is the whole blob and is taken as a
    /// single save; any later short chunk terminates the stream. The
    /// observed digest is verified against the requested one on completion.
    pub async fn fetch_from_peer<F, Fut>(&self, fetch: F, digest: Digest) -> Result<()>
    where
        F: Fn(ChunkRequest) -> Fut,
        Fut: std::future::Future<Output = Result<Bytes>>,
    {
        if self.has(&digest) {
            return Ok(());
        }

        let mut writer: Option<BlobWriter> = None;
        let mut written: u64 = 0;
        loop {
            let chunk = fetch(ChunkRequest {
                digest,
                start: written,
                end: written + CHUNK_SIZE as u64,
            })
            .await?;

            if chunk.len() < CHUNK_SIZE && written == 0 {
                let saved = self.save(&chunk)?;
                if saved != digest {
                    warn!(expected = %digest, actual = %saved, "corrupt blob from peer");
                    return Err(StoreError::DigestMismatch {
                        expected: digest,
                        actual: saved,
                    });
                }
                return Ok(());
            }

            if writer.is_none() {
                writer = Some(BlobWriter::new(&self.dir)?);
            }
            let w = writer.as_mut().expect("writer just created");
            w.write_all(&chunk)?;
            written += chunk.len() as u64;
            if chunk.len() < CHUNK_SIZE {
                break;
            }
        }

        let saved = writer.expect("writer set after first full chunk").finish(&self.dir)?;
        self.lock().have.insert(saved);
        if saved != digest {
            warn!(expected = %digest, actual = %saved, "corrupt blob from peer");
            return Err(StoreError::DigestMismatch {
                expected: digest,
                actual: saved,
            });
        }
        Ok(())
    }

    /// Serves one chunk range to a peer, preferring the memory LRU and
    /// falling back to a positioned read on disk. Short chunks signal the
    /// end of the blob.
    pub fn serve(&self, req: &ChunkRequest) -> Result<Bytes> {
        if let Some(content) = self.contents_if_loaded(&req.digest) {
            let start = (req.start as usize).min(content.len());
            let end = (req.end as usize).min(content.len());
            return Ok(content.slice(start..end));
        }

        let file = match fs::File::open(self.path(&req.digest)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(req.digest));
            }
            Err(e) => return Err(e.into()),
        };

        let want = (req.end - req.start) as usize;
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = file.read_at(&mut buf[filled..], req.start + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    fn admit_to_memory(&self, digest: Digest, content: &[u8]) {
        if content.len() >= MEMORY_LIMIT {
            return;
        }
        let mut state = self.lock();
        if let Some(memory) = state.memory.as_mut() {
            memory.put(digest, Bytes::copy_from_slice(content));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("store lock poisoned")
    }
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ContentStore")
            .field("dir", &self.dir)
            .field("blobs", &state.have.len())
            .field("faulting", &state.faulting.len())
            .finish()
    }
}

/// Sharded on-disk location for a digest: `<dir>/<hex[0..2]>/<hex[2..]>`.
fn hash_path(dir: &Path, digest: &Digest) -> PathBuf {
    let hex = digest.to_hex();
    dir.join(&hex[..2]).join(&hex[2..])
}

/// Rebuilds the `have` set by walking the two-level sharded layout.
fn read_hex_database(dir: &Path) -> Result<HashSet<Digest>> {
    let mut have = HashSet::new();
    for shard in fs::read_dir(dir)? {
        let shard = shard?;
        let prefix = shard.file_name();
        let Some(prefix) = prefix.to_str() else {
            continue;
        };
        if prefix.len() != 2 || !shard.file_type()?.is_dir() {
            continue;
        }
        for entry in fs::read_dir(shard.path())? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(digest) = Digest::from_hex(&format!("{prefix}{name}")) {
                have.insert(digest);
            }
        }
    }
    Ok(have)
}

/// Writes a blob to a temporary file while hashing, then renames it into
/// its sharded location once the digest is known.
struct BlobWriter {
    tmp: NamedTempFile,
    hasher: Sha256,
}

impl BlobWriter {
    fn new(dir: &Path) -> Result<Self> {
        Ok(Self {
            tmp: NamedTempFile::new_in(dir)?,
            hasher: Sha256::new(),
        })
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.tmp.as_file_mut().write_all(buf)?;
        self.hasher.update(buf);
        Ok(())
    }

    fn finish(self, dir: &Path) -> Result<Digest> {
        let digest = Digest::from_bytes(self.hasher.finalize().into());
        let dest = hash_path(dir, &digest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        self.tmp
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o444))?;
        self.tmp
            .persist(&dest)
            .map_err(|e| StoreError::Rename(format!("{}: {}", dest.display(), e.error)))?;
        Ok(digest)
    }
}
