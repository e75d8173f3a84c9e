use std::fs::{self, DirBuilder, File, OpenOptions, ReadDir};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use cask_types::{is_valid_key, validate_key};

use crate::bucket::Bucket;
use crate::error::{StoreError, StoreResult};
use crate::options::StoreOptions;

/// Bucket persisting each document as its own file.
///
/// Layout: `root/<bucket>/<key[..hash_chars]>/<key>`, file contents are the
/// raw document bytes with no framing. Sharding by key prefix bounds the
/// fan-out of any single directory; shard directories are created lazily on
/// first write, not pre-provisioned.
///
/// Writes use exclusive-create semantics: a concurrent writer racing on the
/// same key is benign because whoever loses the race finds `AlreadyExists`,
/// which content addressing makes equivalent to success.
pub struct FilesystemBucket {
    name: String,
    root: PathBuf,
    options: StoreOptions,
}

impl FilesystemBucket {
    /// Open (or create) the bucket directory under `root_directory`.
    pub fn open(root_directory: &Path, name: &str, options: StoreOptions) -> StoreResult<Self> {
        let root = root_directory.join(name);
        let mut builder = DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(options.dirmode);
        }
        builder.create(&root)?;
        debug!(bucket = %name, root = %root.display(), "opened filesystem bucket");
        Ok(Self {
            name: name.to_string(),
            root,
            options,
        })
    }

    fn shard_dir(&self, key: &str) -> PathBuf {
        let prefix = &key[..self.options.hash_chars.min(key.len())];
        self.root.join(prefix)
    }

    fn pathname(&self, key: &str) -> PathBuf {
        self.shard_dir(key).join(key)
    }

    fn audit_check(&self, key: &str, document: &str) -> StoreResult<()> {
        if self.options.audit {
            let computed = self.options.data_hash.digest_hex(document.as_bytes());
            if computed != key {
                return Err(StoreError::AuditFailure {
                    key: key.to_string(),
                    computed,
                });
            }
        }
        Ok(())
    }

    /// Exclusive-create write. `AlreadyExists` is success (the key's content
    /// is invariant); a missing shard directory is created and the write
    /// retried once.
    fn write_new(&self, key: &str, document: &str, retry: bool) -> StoreResult<()> {
        let mut open_options = OpenOptions::new();
        open_options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            open_options.mode(self.options.filemode);
        }

        match open_options.open(self.pathname(key)) {
            Ok(mut file) => {
                file.write_all(document.as_bytes())?;
                if !self.options.delayed_sync {
                    file.sync_all()?;
                }
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound && retry => {
                self.create_shard_dir(key)?;
                self.write_new(key, document, false)
            }
            Err(error) => Err(error.into()),
        }
    }

    fn create_shard_dir(&self, key: &str) -> io::Result<()> {
        let mut builder = DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(self.options.dirmode);
        }
        match builder.create(self.shard_dir(key)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(error) => Err(error),
        }
    }

    fn walk(&self) -> StoreResult<ShardWalk<'_>> {
        let shards = match fs::read_dir(&self.root) {
            Ok(shards) => Some(shards),
            Err(error) if error.kind() == ErrorKind::NotFound => None,
            Err(error) => return Err(error.into()),
        };
        Ok(ShardWalk {
            bucket: self,
            shards,
            current: None,
        })
    }
}

impl Bucket for FilesystemBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_root(&self) -> &str {
        &self.options.query_root
    }

    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        validate_key(key, self.options.data_hash)?;
        match fs::read_to_string(self.pathname(key)) {
            Ok(document) => {
                self.audit_check(key, &document)?;
                Ok(Some(document))
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn put(&self, document: &str, key: Option<&str>) -> StoreResult<String> {
        let key = match key {
            Some(key) => {
                validate_key(key, self.options.data_hash)?;
                key.to_string()
            }
            None => self.options.data_hash.digest_hex(document.as_bytes()),
        };
        self.audit_check(&key, document)?;
        self.write_new(&key, document, true)?;
        Ok(key)
    }

    fn contains(&self, key: &str) -> StoreResult<bool> {
        validate_key(key, self.options.data_hash)?;
        Ok(self.pathname(key).is_file())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key, self.options.data_hash)?;
        match fs::remove_file(self.pathname(key)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn keys(&self) -> StoreResult<Box<dyn Iterator<Item = String> + '_>> {
        let walk = self.walk()?;
        Ok(Box::new(walk.map(|(key, _path)| key)))
    }

    fn items(&self) -> StoreResult<Box<dyn Iterator<Item = StoreResult<(String, Value)>> + '_>> {
        let walk = self.walk()?;
        let audit = self.options.audit;
        let algorithm = self.options.data_hash;
        Ok(Box::new(walk.filter_map(move |(key, path)| {
            let document = match fs::read_to_string(&path) {
                Ok(document) => document,
                Err(error) => {
                    warn!(path = %path.display(), %error, "cannot read stored document, skipping");
                    return None;
                }
            };
            if audit {
                let computed = algorithm.digest_hex(document.as_bytes());
                if computed != key {
                    return Some(Err(StoreError::AuditFailure { key, computed }));
                }
            }
            match serde_json::from_str(&document) {
                Ok(value) => Some(Ok((key, value))),
                Err(error) => {
                    warn!(path = %path.display(), %error, "skipping undecodable document");
                    None
                }
            }
        })))
    }

    /// Filesystem-level sync of the bucket root: one call covers every
    /// outstanding write batched under `delayed_sync`. A bucket whose
    /// directory has been deleted has nothing left to flush.
    fn sync(&self) -> StoreResult<()> {
        match File::open(&self.root) {
            Ok(root) => {
                sync_filesystem(&root)?;
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn delete_everything(&self) -> StoreResult<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(target_os = "linux")]
fn sync_filesystem(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // syncfs flushes the whole filesystem containing the fd, covering every
    // document file regardless of shard.
    if unsafe { libc::syncfs(file.as_raw_fd()) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn sync_filesystem(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Lazy walk over the bucket's shard directories yielding
/// `(key, file path)` pairs.
///
/// Files whose names are not well-formed keys are stray and skipped with a
/// warning; so are unreadable shard directories. The walk reflects storage
/// at iteration time, not a cached snapshot.
struct ShardWalk<'a> {
    bucket: &'a FilesystemBucket,
    shards: Option<ReadDir>,
    current: Option<ReadDir>,
}

impl Iterator for ShardWalk<'_> {
    type Item = (String, PathBuf);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entries) = &mut self.current {
                for entry in entries.by_ref() {
                    let entry = match entry {
                        Ok(entry) => entry,
                        Err(error) => {
                            warn!(%error, "error while scanning shard directory, skipping entry");
                            continue;
                        }
                    };
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else {
                        warn!(path = %entry.path().display(), "ignoring non-UTF-8 file name");
                        continue;
                    };
                    if !is_valid_key(name, self.bucket.options.data_hash) {
                        warn!(path = %entry.path().display(), "ignoring stray file");
                        continue;
                    }
                    return Some((name.to_string(), entry.path()));
                }
                self.current = None;
            }

            let shards = self.shards.as_mut()?;
            let shard = match shards.next()? {
                Ok(shard) => shard,
                Err(error) => {
                    warn!(%error, "error while scanning bucket root, skipping entry");
                    continue;
                }
            };
            let path = shard.path();
            if !path.is_dir() {
                warn!(path = %path.display(), "ignoring stray file");
                continue;
            }
            match fs::read_dir(&path) {
                Ok(entries) => self.current = Some(entries),
                Err(error) => {
                    warn!(path = %path.display(), %error, "cannot read shard directory, skipping");
                }
            }
        }
    }
}
