use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, DirBuilder};
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::bucket::Bucket;
use crate::error::StoreResult;
use crate::filesystem::FilesystemBucket;
use crate::options::StoreOptions;
use crate::query::{Combine, Filter, MatchMap};
use crate::relational::{ConnectionRegistry, RelationalBucket};

/// Which storage engine a [`Store`] runs on.
#[derive(Clone, Debug)]
pub enum Backend {
    /// One directory tree per bucket under `root_directory`.
    Filesystem { root_directory: PathBuf },
    /// One table per bucket inside the SQLite file at `pathname`.
    Relational { pathname: PathBuf },
}

/// Facade over a collection of named buckets on one backend.
///
/// Buckets are created lazily by [`Store::bucket`] and cached for the
/// lifetime of the store; buckets already present in storage are discovered
/// at open time. All buckets share the store's [`StoreOptions`].
pub struct Store {
    backend: Backend,
    options: StoreOptions,
    registry: Arc<ConnectionRegistry>,
    buckets: HashMap<String, Box<dyn Bucket>>,
}

impl Store {
    /// Open a store, discovering every bucket the backend already holds.
    ///
    /// The store gets its own connection registry; relational stores opened
    /// this way never share a connection with another store. Use
    /// [`Store::open_with_registry`] to share one.
    pub fn open(backend: Backend, options: StoreOptions) -> StoreResult<Self> {
        Self::open_with_registry(backend, options, Arc::new(ConnectionRegistry::new()))
    }

    /// Open a store against a shared connection registry.
    ///
    /// Stores handed the same registry and database path share one
    /// connection and one transaction, so writes in one are visible in the
    /// other before any `sync()` and a commit through either covers both.
    pub fn open_with_registry(
        backend: Backend,
        options: StoreOptions,
        registry: Arc<ConnectionRegistry>,
    ) -> StoreResult<Self> {
        let mut store = Self {
            backend,
            options,
            registry,
            buckets: HashMap::new(),
        };
        for name in store.discover()? {
            store.bucket(&name)?;
        }
        debug!(buckets = store.buckets.len(), "opened store");
        Ok(store)
    }

    /// Names of buckets present in storage right now.
    fn discover(&self) -> StoreResult<Vec<String>> {
        match &self.backend {
            Backend::Filesystem { root_directory } => {
                let mut builder = DirBuilder::new();
                builder.recursive(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::DirBuilderExt;
                    builder.mode(self.options.dirmode);
                }
                builder.create(root_directory)?;

                let mut names = Vec::new();
                for entry in fs::read_dir(root_directory)? {
                    let entry = entry?;
                    let path = entry.path();
                    if !path.is_dir() {
                        warn!(path = %path.display(), "ignoring stray file in store root");
                        continue;
                    }
                    match entry.file_name().into_string() {
                        Ok(name) => names.push(name),
                        Err(name) => {
                            warn!(?name, "ignoring non-UTF-8 bucket directory");
                        }
                    }
                }
                Ok(names)
            }
            Backend::Relational { pathname } => {
                let handle = self.registry.handle(pathname)?;
                let instance = handle.lock().expect("lock poisoned");
                Ok(instance.bucket_names())
            }
        }
    }

    /// The bucket named `name`, opening it on first access.
    pub fn bucket(&mut self, name: &str) -> StoreResult<&dyn Bucket> {
        match self.buckets.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(&**entry.into_mut()),
            Entry::Vacant(entry) => {
                let bucket: Box<dyn Bucket> = match &self.backend {
                    Backend::Filesystem { root_directory } => Box::new(
                        FilesystemBucket::open(root_directory, name, self.options.clone())?,
                    ),
                    Backend::Relational { pathname } => {
                        let handle = self.registry.handle(pathname)?;
                        Box::new(RelationalBucket::open(handle, name, self.options.clone()))
                    }
                };
                Ok(&**entry.insert(bucket))
            }
        }
    }

    /// Names of every bucket this store has opened.
    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.keys().cloned().collect()
    }

    // Delegating operations: resolve (or create) the named bucket, then
    // forward. They take `&mut self` because the first touch of a bucket
    // name creates it.

    /// Read the raw document stored under `key` in `bucket`.
    pub fn get(&mut self, bucket: &str, key: &str) -> StoreResult<Option<String>> {
        self.bucket(bucket)?.get(key)
    }

    /// Store a document in `bucket`, computing the content key when `key`
    /// is not supplied.
    pub fn put(&mut self, bucket: &str, document: &str, key: Option<&str>) -> StoreResult<String> {
        self.bucket(bucket)?.put(document, key)
    }

    /// Whether `key` currently has a stored document in `bucket`.
    pub fn contains(&mut self, bucket: &str, key: &str) -> StoreResult<bool> {
        self.bucket(bucket)?.contains(key)
    }

    /// Remove the entry for `key` in `bucket`. Absent is success.
    pub fn delete(&mut self, bucket: &str, key: &str) -> StoreResult<()> {
        self.bucket(bucket)?.delete(key)
    }

    /// Run an equality query against `bucket`.
    pub fn equality_query(
        &mut self,
        bucket: &str,
        filters: &[Filter],
        combine: Combine,
    ) -> StoreResult<Vec<(String, MatchMap)>> {
        self.bucket(bucket)?.equality_query(filters, combine)
    }

    /// Make every write issued so far durable.
    ///
    /// Stops after the first bucket whose sync covers its siblings, so a
    /// relational store commits its shared transaction exactly once.
    pub fn sync(&self) -> StoreResult<()> {
        for bucket in self.buckets.values() {
            bucket.sync()?;
            if bucket.sync_is_shared() {
                break;
            }
        }
        Ok(())
    }

    /// All `(bucket name, key)` pairs across every opened bucket.
    pub fn keys(&self) -> StoreResult<Vec<(String, String)>> {
        let mut all = Vec::new();
        for (name, bucket) in &self.buckets {
            for key in bucket.keys()? {
                all.push((name.clone(), key));
            }
        }
        Ok(all)
    }

    /// All `(bucket name, key, parsed document)` triples across every
    /// opened bucket.
    pub fn items(&self) -> StoreResult<Vec<(String, String, Value)>> {
        let mut all = Vec::new();
        for (name, bucket) in &self.buckets {
            for entry in bucket.items()? {
                let (key, document) = entry?;
                all.push((name.clone(), key, document));
            }
        }
        Ok(all)
    }

    /// Irreversibly remove every bucket and all stored documents.
    pub fn delete_everything(&mut self) -> StoreResult<()> {
        for bucket in self.buckets.values() {
            bucket.delete_everything()?;
        }
        self.sync()?;
        self.buckets.clear();
        Ok(())
    }
}
