//! Per-path attributes and file sets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Names one [`FileSet`] within a mirror session.
///
/// Ids form a dense ascending sequence; replay of the same id is idempotent.
pub type FileSetId = u64;

/// Attributes of one path, as shipped between master and workers.
///
/// Paths are relative to the writable root and `/`-separated. A deletion is
/// encoded by an otherwise-empty record (`mode == None`). If `digest` is
/// set, the content store on some reachable peer holds a matching blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttr {
    /// Root-relative path.
    pub path: String,
    /// Full mode bits including the file type; `None` encodes a deletion.
    pub mode: Option<u32>,
    /// Size in bytes.
    pub size: u64,
    /// Modification time in nanoseconds since the epoch.
    pub mtime_ns: i64,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Symlink target, for symlinks.
    pub link: Option<String>,
    /// Content digest, for regular files.
    pub digest: Option<Digest>,
    /// Directory listing: name → mode, for directories.
    pub entries: Option<BTreeMap<String, u32>>,
}

impl FileAttr {
    const S_IFMT: u32 = 0o170_000;
    const S_IFDIR: u32 = 0o040_000;
    const S_IFREG: u32 = 0o100_000;
    const S_IFLNK: u32 = 0o120_000;

    /// Creates a deletion record for `path`.
    #[must_use]
    pub fn deletion(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: None,
            size: 0,
            mtime_ns: 0,
            uid: 0,
            gid: 0,
            link: None,
            digest: None,
            entries: None,
        }
    }

    /// Creates a regular-file record.
    #[must_use]
    pub fn regular(path: impl Into<String>, perm: u32, size: u64, digest: Digest) -> Self {
        Self {
            path: path.into(),
            mode: Some(Self::S_IFREG | (perm & 0o7777)),
            size,
            mtime_ns: 0,
            uid: 0,
            gid: 0,
            link: None,
            digest: Some(digest),
            entries: None,
        }
    }

    /// Creates a directory record with an empty listing.
    #[must_use]
    pub fn directory(path: impl Into<String>, perm: u32) -> Self {
        Self {
            path: path.into(),
            mode: Some(Self::S_IFDIR | (perm & 0o7777)),
            size: 0,
            mtime_ns: 0,
            uid: 0,
            gid: 0,
            link: None,
            digest: None,
            entries: Some(BTreeMap::new()),
        }
    }

    /// Creates a symlink record.
    #[must_use]
    pub fn symlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: Some(Self::S_IFLNK | 0o777),
            size: 0,
            mtime_ns: 0,
            uid: 0,
            gid: 0,
            link: Some(target.into()),
            digest: None,
            entries: None,
        }
    }

    /// Returns true if this record encodes a deletion.
    #[must_use]
    pub const fn is_deletion(&self) -> bool {
        self.mode.is_none()
    }

    /// Returns true for directories.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode
            .is_some_and(|m| m & Self::S_IFMT == Self::S_IFDIR)
    }

    /// Returns true for regular files.
    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode
            .is_some_and(|m| m & Self::S_IFMT == Self::S_IFREG)
    }

    /// Returns true for symlinks.
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode
            .is_some_and(|m| m & Self::S_IFMT == Self::S_IFLNK)
    }

    /// Permission bits without the file type.
    #[must_use]
    pub fn perm(&self) -> u32 {
        self.mode.map_or(0, |m| m & 0o7777)
    }
}

/// Splits a relative path into its parent directory and base name.
///
/// The root's parent is the empty string: `split_path("c") == ("", "c")`.
#[must_use]
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

/// An ordered batch of per-path changes produced by one completed job.
///
/// Entries are ordered shallow-first (parents before children), with
/// deletions last, deepest-first, so a directory is only removed once its
/// descendants are gone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSet {
    pub files: Vec<FileAttr>,
}

impl FileSet {
    /// Creates a file set and puts it in canonical order.
    #[must_use]
    pub fn new(mut files: Vec<FileAttr>) -> Self {
        sort_canonical(&mut files);
        Self { files }
    }

    /// Returns true if the set carries no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }
}

fn depth(path: &str) -> usize {
    path.split('/').count()
}

/// Sorts entries into canonical replay order: creations and updates
/// shallow-first, then deletions deepest-first.
pub fn sort_canonical(files: &mut [FileAttr]) {
    files.sort_by(|a, b| {
        match (a.is_deletion(), b.is_deletion()) {
            (false, true) => std::cmp::Ordering::Less,
            (true, false) => std::cmp::Ordering::Greater,
            (false, false) => depth(&a.path)
                .cmp(&depth(&b.path))
                .then_with(|| a.path.cmp(&b.path)),
            (true, true) => depth(&b.path)
                .cmp(&depth(&a.path))
                .then_with(|| a.path.cmp(&b.path)),
        }
    });
}
