use cask_types::HashAlgorithm;

/// Configuration shared by every bucket of a store.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Digest algorithm used to derive content keys.
    pub data_hash: HashAlgorithm,
    /// Number of leading key characters used as the shard directory name
    /// (filesystem backend only).
    pub hash_chars: usize,
    /// POSIX permission bits for created directories.
    pub dirmode: u32,
    /// POSIX permission bits for created files.
    pub filemode: u32,
    /// When `true` (the default), individual writes are not fsynced;
    /// durability is deferred to an explicit `sync()`.
    pub delayed_sync: bool,
    /// Sub-key of each document that equality queries are scoped to.
    /// The empty string scopes queries to the whole document.
    pub query_root: String,
    /// Re-verify that stored content hashes to its key on every read and
    /// write. A mismatch is storage corruption and is always fatal.
    pub audit: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            data_hash: HashAlgorithm::default(),
            hash_chars: 3,
            dirmode: 0o755,
            filemode: 0o644,
            delayed_sync: true,
            query_root: "data".to_string(),
            audit: false,
        }
    }
}
