//! Content-addressed blob store shared in shape by master and workers.
//!
//! Blobs are keyed by their [`Digest`] and live in a two-level sharded
//! directory layout, with a bounded in-memory LRU in front of the disk.
//! Concurrent loads of the same digest coalesce onto a single reader.
//!
//! [`Digest`]: termite_attr::Digest

mod error;
mod store;

pub use error::{Result, StoreError};
pub use store::{ChunkRequest, ContentStore, StoreOptions, CHUNK_SIZE, MEMORY_LIMIT};
