//! Per-path attribute cache with update broadcasts.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::trace;

use crate::attr::{split_path, FileAttr};

/// Callback that fetches an authoritative attribute for a path, or `None`
/// when the path does not exist on the authority.
pub type FetchFn = Box<dyn Fn(&str) -> Option<FileAttr> + Send + Sync>;

/// Result of a cache-only lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// A cached attribute (possibly a deletion record).
    Hit(FileAttr),
    /// The path is cached as non-existent.
    Negative,
    /// Nothing is cached for the path.
    Miss,
}

/// Maps root-relative paths to [`FileAttr`], with an inverted directory
/// index: a cached directory's `entries` map always agrees with the set of
/// cached child paths.
///
/// Negative results are cached. Batches applied through [`update`] are
/// atomic with respect to [`get`].
///
/// [`update`]: AttributeCache::update
/// [`get`]: AttributeCache::get
pub struct AttributeCache {
    // None = cached negative result.
    attrs: RwLock<HashMap<String, Option<FileAttr>>>,
    fetch: Option<FetchFn>,
}

impl AttributeCache {
    /// Creates a cache backed by a fetch callback for misses.
    #[must_use]
    pub fn new(fetch: FetchFn) -> Self {
        Self {
            attrs: RwLock::new(HashMap::new()),
            fetch: Some(fetch),
        }
    }

    /// Creates a cache with no authority; misses return `None` and are not
    /// cached. Used where an async caller fills the cache via [`insert`].
    ///
    /// [`insert`]: AttributeCache::insert
    #[must_use]
    pub fn without_fetch() -> Self {
        Self {
            attrs: RwLock::new(HashMap::new()),
            fetch: None,
        }
    }

    /// Cached lookup; on miss invokes the fetch callback and caches the
    /// result, negative results included.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<FileAttr> {
        match self.lookup(path) {
            Lookup::Hit(attr) => return Some(attr),
            Lookup::Negative => return None,
            Lookup::Miss => {}
        }

        let fetched = self.fetch.as_ref().and_then(|f| f(path));
        if self.fetch.is_some() {
            self.insert(path, fetched.clone());
        }
        fetched
    }

    /// Cache-only lookup, for callers that resolve misses themselves.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Lookup {
        let attrs = self.attrs.read().expect("attribute cache poisoned");
        match attrs.get(path) {
            Some(Some(attr)) => Lookup::Hit(attr.clone()),
            Some(None) => Lookup::Negative,
            None => Lookup::Miss,
        }
    }

    /// Records the authoritative answer for one path.
    pub fn insert(&self, path: &str, attr: Option<FileAttr>) {
        let mut attrs = self.attrs.write().expect("attribute cache poisoned");
        attrs.insert(path.to_owned(), attr);
    }

    /// Applies a batch of updates atomically with respect to [`get`].
    ///
    /// For each entry the path is overwritten, the name is inserted into or
    /// removed from its parent's listing, and deletions purge any cached
    /// descendants.
    ///
    /// [`get`]: AttributeCache::get
    pub fn update(&self, files: &[FileAttr]) {
        let mut attrs = self.attrs.write().expect("attribute cache poisoned");
        for attr in files {
            let (dir, base) = split_path(&attr.path);
            trace!(path = %attr.path, deletion = attr.is_deletion(), "attr update");

            if attr.is_deletion() {
                attrs.insert(attr.path.clone(), Some(attr.clone()));
                let prefix = format!("{}/", attr.path);
                attrs.retain(|p, _| !p.starts_with(&prefix));
                if !base.is_empty() {
                    if let Some(Some(parent)) = attrs.get_mut(dir) {
                        if let Some(entries) = parent.entries.as_mut() {
                            entries.remove(base);
                        }
                    }
                }
            } else {
                attrs.insert(attr.path.clone(), Some(attr.clone()));
                if !base.is_empty() {
                    if let Some(Some(parent)) = attrs.get_mut(dir) {
                        if let Some(entries) = parent.entries.as_mut() {
                            entries.insert(base.to_owned(), attr.mode.unwrap_or(0));
                        }
                    }
                }
            }
        }
    }

    /// Paths with a cached answer, negative entries included. Used when the
    /// writable root may have changed behind the cache and every cached
    /// answer needs a re-check.
    #[must_use]
    pub fn cached_paths(&self) -> Vec<String> {
        self.attrs
            .read()
            .expect("attribute cache poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Drops every cached entry.
    pub fn clear(&self) {
        self.attrs.write().expect("attribute cache poisoned").clear();
    }

    /// Number of cached paths (negative entries included).
    #[must_use]
    pub fn len(&self) -> usize {
        self.attrs.read().expect("attribute cache poisoned").len()
    }

    /// Returns true if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for AttributeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeCache")
            .field("entries", &self.len())
            .field("has_fetch", &self.fetch.is_some())
            .finish()
    }
}
