//! File-set replay: applying a batch of path changes to a writable root.
//!
//! Content is fetched before any on-disk mutation so a failed fetch never
//! leaves the tree half-applied. Entries then apply in canonical order and
//! the attribute cache is updated with the same batch. Replay is
//! idempotent.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use bytes::Bytes;
use filetime::FileTime;
use rand::Rng;
use termite_attr::{AttributeCache, FileAttr, FileSet};
use termite_store::{ChunkRequest, ContentStore, StoreError};
use tracing::trace;

use crate::error::Result;

/// Fetches any missing content from a peer, then applies the set.
pub async fn replay_file_set<F, Fut>(
    root: &Path,
    store: &ContentStore,
    attrs: &AttributeCache,
    fset: &FileSet,
    fetch: F,
) -> Result<()>
where
    F: Fn(ChunkRequest) -> Fut,
    Fut: std::future::Future<Output = termite_store::Result<Bytes>>,
{
    for file in &fset.files {
        if let Some(digest) = file.digest {
            if !store.has(&digest) {
                store.fetch_from_peer(&fetch, digest).await?;
            }
        }
    }
    apply_file_set(root, store, attrs, fset)
}

/// Applies a file set whose content is already present in the store.
///
/// Fails before touching the tree if any digest is missing.
pub fn apply_file_set(
    root: &Path,
    store: &ContentStore,
    attrs: &AttributeCache,
    fset: &FileSet,
) -> Result<()> {
    for file in &fset.files {
        if let Some(digest) = file.digest {
            if !store.has(&digest) {
                return Err(StoreError::NotFound(digest).into());
            }
        }
    }

    for file in &fset.files {
        apply_entry(root, store, file)?;
    }
    attrs.update(&fset.files);
    Ok(())
}

fn apply_entry(root: &Path, store: &ContentStore, attr: &FileAttr) -> Result<()> {
    let target = root.join(&attr.path);
    trace!(path = %attr.path, deletion = attr.is_deletion(), "replay entry");

    if attr.is_deletion() {
        match fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&target)?,
            Ok(_) => fs::remove_file(&target)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        return Ok(());
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    if attr.is_dir() {
        if !target.is_dir() {
            remove_if_exists(&target)?;
            fs::create_dir(&target)?;
        }
        fs::set_permissions(&target, fs::Permissions::from_mode(attr.perm()))?;
        return Ok(());
    }

    if attr.is_symlink() {
        let link = attr.link.as_deref().unwrap_or_default();
        // Build the link aside and rename over the target so the visible
        // transition is single-step.
        let tmp = target.with_file_name(format!(
            ".{}.lnk{}",
            target.file_name().unwrap_or_default().to_string_lossy(),
            rand::thread_rng().gen::<u32>()
        ));
        std::os::unix::fs::symlink(link, &tmp)?;
        fs::rename(&tmp, &target)?;
        return Ok(());
    }

    // Regular file: copy out of the store, then stamp mode and mtime.
    let digest = attr
        .digest
        .ok_or_else(|| StoreError::Fetch(format!("{}: no digest", attr.path)))?;
    remove_if_exists(&target)?;
    fs::copy(store.path(&digest), &target)?;
    fs::set_permissions(&target, fs::Permissions::from_mode(attr.perm()))?;
    let mtime = FileTime::from_unix_time(
        attr.mtime_ns.div_euclid(1_000_000_000),
        attr.mtime_ns.rem_euclid(1_000_000_000) as u32,
    );
    filetime::set_file_mtime(&target, mtime)?;
    Ok(())
}

fn remove_if_exists(target: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(target),
        Ok(_) => fs::remove_file(target),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use termite_attr::Digest;
    use termite_store::StoreOptions;

    fn setup() -> (tempfile::TempDir, ContentStore, AttributeCache) {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(&StoreOptions {
            dir: dir.path().join("cache"),
            memory_cache_entries: 64,
        })
        .unwrap();
        fs::create_dir_all(dir.path().join("root")).unwrap();
        (dir, store, AttributeCache::without_fetch())
    }

    fn file_attr(store: &ContentStore, path: &str, perm: u32, content: &[u8]) -> FileAttr {
        let digest = store.save(content).unwrap();
        let mut attr = FileAttr::regular(path, perm, content.len() as u64, digest);
        attr.mtime_ns = 1_700_000_000_000_000_000;
        attr
    }

    #[test]
    fn test_apply_creates_tree() {
        let (dir, store, attrs) = setup();
        let root = dir.path().join("root");

        let fset = FileSet::new(vec![
            FileAttr::directory("a", 0o755),
            FileAttr::directory("a/b", 0o755),
            file_attr(&store, "a/b/f.txt", 0o644, b"payload"),
            FileAttr::symlink("a/link", "b/f.txt"),
        ]);
        apply_file_set(&root, &store, &attrs, &fset).unwrap();

        assert!(root.join("a/b").is_dir());
        assert_eq!(fs::read(root.join("a/b/f.txt")).unwrap(), b"payload");
        assert_eq!(
            fs::read_link(root.join("a/link")).unwrap(),
            std::path::PathBuf::from("b/f.txt")
        );
        let mode = fs::metadata(root.join("a/b/f.txt")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let (dir, store, attrs) = setup();
        let root = dir.path().join("root");

        let fset = FileSet::new(vec![
            FileAttr::directory("d", 0o755),
            file_attr(&store, "d/f", 0o444, b"read only"),
        ]);
        apply_file_set(&root, &store, &attrs, &fset).unwrap();
        apply_file_set(&root, &store, &attrs, &fset).unwrap();

        assert_eq!(fs::read(root.join("d/f")).unwrap(), b"read only");
    }

    #[test]
    fn test_apply_deletion() {
        let (dir, store, attrs) = setup();
        let root = dir.path().join("root");

        apply_file_set(
            &root,
            &store,
            &attrs,
            &FileSet::new(vec![
                FileAttr::directory("d", 0o755),
                file_attr(&store, "d/f", 0o644, b"x"),
            ]),
        )
        .unwrap();

        let deletions = FileSet::new(vec![FileAttr::deletion("d/f"), FileAttr::deletion("d")]);
        apply_file_set(&root, &store, &attrs, &deletions).unwrap();
        assert!(!root.join("d").exists());

        // Deleting what is already gone is a no-op.
        apply_file_set(&root, &store, &attrs, &deletions).unwrap();
    }

    #[test]
    fn test_missing_content_fails_before_mutation() {
        let (dir, store, attrs) = setup();
        let root = dir.path().join("root");

        let fset = FileSet::new(vec![
            FileAttr::directory("new", 0o755),
            FileAttr::regular("new/f", 0o644, 1, Digest::of(b"never saved")),
        ]);
        assert!(apply_file_set(&root, &store, &attrs, &fset).is_err());
        // Nothing was applied.
        assert!(!root.join("new").exists());
    }

    #[test]
    fn test_empty_fileset_is_noop() {
        let (dir, store, attrs) = setup();
        let root = dir.path().join("root");
        apply_file_set(&root, &store, &attrs, &FileSet::default()).unwrap();
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    }

    #[test]
    fn test_symlink_replaced_atomically() {
        let (dir, store, attrs) = setup();
        let root = dir.path().join("root");

        apply_file_set(
            &root,
            &store,
            &attrs,
            &FileSet::new(vec![FileAttr::symlink("l", "old")]),
        )
        .unwrap();
        apply_file_set(
            &root,
            &store,
            &attrs,
            &FileSet::new(vec![FileAttr::symlink("l", "new")]),
        )
        .unwrap();

        assert_eq!(
            fs::read_link(root.join("l")).unwrap(),
            std::path::PathBuf::from("new")
        );
    }

    #[tokio::test]
    async fn test_replay_fetches_missing_content() {
        let (dir, store, attrs) = setup();
        let root = dir.path().join("root");

        let content = Bytes::from_static(b"remote bytes");
        let digest = Digest::of(&content);
        let fset = FileSet::new(vec![FileAttr::regular("r.txt", 0o644, content.len() as u64, digest)]);

        let served = content.clone();
        replay_file_set(&root, &store, &attrs, &fset, move |req: ChunkRequest| {
            let served = served.clone();
            async move {
                let start = (req.start as usize).min(served.len());
                let end = (req.end as usize).min(served.len());
                Ok(served.slice(start..end))
            }
        })
        .await
        .unwrap();

        assert_eq!(fs::read(root.join("r.txt")).unwrap(), b"remote bytes");
        assert!(store.has(&digest));
    }
}
