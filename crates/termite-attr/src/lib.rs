//! File attributes, file sets, and the per-path attribute cache.
//!
//! These types travel between master and workers: a [`FileAttr`] describes
//! one path (mode, size, symlink target, content digest, directory listing),
//! a [`FileSet`] is the ordered batch of changes produced by one completed
//! job, and the [`AttributeCache`] keeps a consistent path → attribute view
//! on each peer.

mod attr;
mod cache;
mod digest;

pub use attr::{split_path, FileAttr, FileSet, FileSetId};
pub use cache::{AttributeCache, FetchFn, Lookup};
pub use digest::Digest;
