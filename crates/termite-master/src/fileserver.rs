//! The master's file server: the authority workers read from.
//!
//! Serves attribute lookups and content chunks for the writable root over a
//! mirror's reverse channel. Regular files are hashed into the content
//! store on first lookup so content requests can be answered by digest.
//! Files with no group/other read permission are withheld unless
//! `expose_private` is set.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use termite_attr::{AttributeCache, FileAttr};
use termite_error::CommonError;
use termite_proto::{AttrResponse, ContentResponse, Request, Response, Service};
use termite_store::ContentStore;
use tracing::{debug, trace};

/// Answers `GetAttr` and `FileContent` for the writable root.
pub struct FileServer {
    root: PathBuf,
    store: Arc<ContentStore>,
    attrs: Arc<AttributeCache>,
    expose_private: bool,
}

impl FileServer {
    #[must_use]
    pub fn new(root: PathBuf, store: Arc<ContentStore>, expose_private: bool) -> Arc<Self> {
        let fetch_root = root.clone();
        let fetch_store = Arc::clone(&store);
        let attrs = Arc::new(AttributeCache::new(Box::new(move |path| {
            stat_path(&fetch_root, &fetch_store, expose_private, path)
        })));
        Arc::new(Self {
            root,
            store,
            attrs,
            expose_private,
        })
    }

    /// The writable root this server exposes.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The attribute cache backing lookups.
    #[must_use]
    pub fn attrs(&self) -> &Arc<AttributeCache> {
        &self.attrs
    }

    /// Authoritative lookup for one path, cached.
    #[must_use]
    pub fn get_attr(&self, path: &str) -> Option<FileAttr> {
        self.attrs.get(path).filter(|a| !a.is_deletion())
    }

    /// Applies a replayed batch to the cache.
    pub fn update_files(&self, files: &[FileAttr]) {
        self.attrs.update(files);
    }

    /// Re-stats every cached path after the root changed behind the cache.
    ///
    /// Returns the attrs that differed, already applied to the cache, so
    /// the caller can ship them to mirrors.
    pub fn refresh(&self) -> Vec<FileAttr> {
        let mut changed = Vec::new();
        for path in self.attrs.cached_paths() {
            let fresh = stat_path(&self.root, &self.store, self.expose_private, &path);
            let cached = self.attrs.get(&path);
            match (cached, fresh) {
                (Some(old), Some(new)) if old != new => changed.push(new),
                (Some(old), None) if !old.is_deletion() => {
                    changed.push(FileAttr::deletion(path));
                }
                (None, Some(new)) => changed.push(new),
                _ => {}
            }
        }
        if !changed.is_empty() {
            debug!(count = changed.len(), "attribute cache refresh");
            self.attrs.update(&changed);
        }
        changed
    }
}

#[async_trait]
impl Service for FileServer {
    async fn handle(&self, request: Request) -> Result<Response, CommonError> {
        match request {
            Request::GetAttr(req) => {
                trace!(path = %req.path, "get attr");
                let attrs = self.get_attr(&req.path).into_iter().collect();
                Ok(Response::Attrs(AttrResponse { attrs }))
            }
            Request::FileContent(req) => {
                let chunk = self
                    .store
                    .serve(&req)
                    .map_err(|e| CommonError::not_found(e.to_string()))?;
                Ok(Response::FileContent(ContentResponse {
                    chunk: chunk.to_vec(),
                }))
            }
            _ => Err(CommonError::policy("not a file server request")),
        }
    }
}

fn stat_path(
    root: &Path,
    store: &ContentStore,
    expose_private: bool,
    path: &str,
) -> Option<FileAttr> {
    let full = if path.is_empty() {
        root.to_path_buf()
    } else {
        root.join(path)
    };
    let meta = fs::symlink_metadata(&full).ok()?;
    if !visible(&meta, expose_private) {
        return None;
    }

    let mut attr = FileAttr {
        path: path.to_owned(),
        mode: Some(meta.mode()),
        size: meta.size(),
        mtime_ns: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
        uid: meta.uid(),
        gid: meta.gid(),
        link: None,
        digest: None,
        entries: None,
    };

    if meta.file_type().is_symlink() {
        attr.link = Some(fs::read_link(&full).ok()?.to_string_lossy().into_owned());
    } else if meta.is_dir() {
        let mut entries = BTreeMap::new();
        for entry in fs::read_dir(&full).ok()? {
            let Ok(entry) = entry else { continue };
            // symlink_metadata: a dangling symlink is still a listable entry.
            let Ok(emeta) = fs::symlink_metadata(entry.path()) else {
                continue;
            };
            if !visible(&emeta, expose_private) {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                entries.insert(name.to_owned(), emeta.mode());
            }
        }
        attr.entries = Some(entries);
    } else if meta.is_file() {
        attr.digest = Some(store.save_path(&full).ok()?);
    }
    Some(attr)
}

fn visible(meta: &fs::Metadata, expose_private: bool) -> bool {
    expose_private || meta.is_dir() || meta.mode() & 0o044 != 0
}
