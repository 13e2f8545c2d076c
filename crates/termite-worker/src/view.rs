//! Job views: the writable tree a command runs in.
//!
//! A view is materialized per job from the mirror's attribute cache and the
//! content store, snapshotted, handed to the command, and walked again
//! afterwards. The difference between the walks is the job's file set.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use termite_attr::{split_path, FileAttr};
use termite_store::ContentStore;

use crate::error::Result;

const S_IFMT: u32 = 0o170_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFLNK: u32 = 0o120_000;

/// Everything worth comparing about one path in a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    pub mode: u32,
    pub size: u64,
    pub mtime_ns: i64,
    pub uid: u32,
    pub gid: u32,
    pub link: Option<String>,
}

/// Path → metadata for a whole view tree.
pub type Snapshot = HashMap<String, WalkEntry>;

/// Walks a view and records every path's metadata.
pub fn snapshot(root: &Path) -> Result<Snapshot> {
    let mut entries = HashMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let full = entry.path();
            let meta = fs::symlink_metadata(&full)?;
            let rel = full
                .strip_prefix(root)
                .expect("walk stays under root")
                .to_string_lossy()
                .into_owned();

            let link = if meta.file_type().is_symlink() {
                Some(fs::read_link(&full)?.to_string_lossy().into_owned())
            } else {
                None
            };
            entries.insert(
                rel,
                WalkEntry {
                    mode: meta.mode(),
                    size: meta.size(),
                    mtime_ns: meta.mtime() * 1_000_000_000 + meta.mtime_nsec(),
                    uid: meta.uid(),
                    gid: meta.gid(),
                    link,
                },
            );
            if meta.is_dir() {
                stack.push(full);
            }
        }
    }
    Ok(entries)
}

/// Diffs the view against its pre-run snapshot and ingests every produced
/// file into the store.
///
/// New and changed regular files are moved into the store with
/// [`destructive_save_path`]; the returned attrs reference them by digest.
/// Paths present before and missing now become deletion records.
///
/// [`destructive_save_path`]: ContentStore::destructive_save_path
pub fn harvest(root: &Path, before: &Snapshot, store: &ContentStore) -> Result<Vec<FileAttr>> {
    let after = snapshot(root)?;
    let mut produced = Vec::new();

    for (path, entry) in &after {
        if before.get(path) == Some(entry) {
            continue;
        }
        let mut attr = FileAttr {
            path: path.clone(),
            mode: Some(entry.mode),
            size: entry.size,
            mtime_ns: entry.mtime_ns,
            uid: entry.uid,
            gid: entry.gid,
            link: entry.link.clone(),
            digest: None,
            entries: None,
        };
        match entry.mode & S_IFMT {
            S_IFDIR => {
                attr.entries = Some(children_of(&after, path));
            }
            S_IFLNK => {}
            _ => {
                attr.digest = Some(store.destructive_save_path(&root.join(path))?);
            }
        }
        produced.push(attr);
    }

    for path in before.keys() {
        if !after.contains_key(path) {
            produced.push(FileAttr::deletion(path.clone()));
        }
    }
    Ok(produced)
}

fn children_of(
    snapshot: &Snapshot,
    dir: &str,
) -> std::collections::BTreeMap<String, u32> {
    snapshot
        .iter()
        .filter(|(path, _)| split_path(path).0 == dir)
        .map(|(path, entry)| (split_path(path).1.to_owned(), entry.mode))
        .collect()
}
