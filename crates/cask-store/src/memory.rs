use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;
use tracing::warn;

use cask_types::validate_key;

use crate::bucket::Bucket;
use crate::error::{StoreError, StoreResult};
use crate::options::StoreOptions;

/// In-memory, HashMap-based bucket.
///
/// Intended for tests and embedding: it honors the full [`Bucket`] contract
/// (content keys, idempotent put, audit) but keeps everything in process
/// memory, so `sync()` is a no-op and nothing survives a restart.
pub struct MemoryBucket {
    name: String,
    options: StoreOptions,
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryBucket {
    /// Create a new empty in-memory bucket.
    pub fn new(name: impl Into<String>, options: StoreOptions) -> Self {
        Self {
            name: name.into(),
            options,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of documents currently stored.
    pub fn len(&self) -> usize {
        self.entries.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the bucket is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().expect("lock poisoned").is_empty()
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
}

impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_root(&self) -> &str {
        &self.options.query_root
    }

    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        validate_key(key, self.options.data_hash)?;
        let entries = self.entries.read().expect("lock poisoned");
        match entries.get(key) {
            Some(document) => {
                self.audit_check(key, document)?;
                Ok(Some(document.clone()))
            }
            None => Ok(None),
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

        let mut entries = self.entries.write().expect("lock poisoned");
        // Idempotent: an existing key keeps its original content.
        entries
            .entry(key.clone())
            .or_insert_with(|| document.to_string());
        Ok(key)
    }

    fn contains(&self, key: &str) -> StoreResult<bool> {
        validate_key(key, self.options.data_hash)?;
        Ok(self.entries.read().expect("lock poisoned").contains_key(key))
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key, self.options.data_hash)?;
        self.entries.write().expect("lock poisoned").remove(key);
        Ok(())
    }

    fn keys(&self) -> StoreResult<Box<dyn Iterator<Item = String> + '_>> {
        let keys: Vec<String> = self
            .entries
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        Ok(Box::new(keys.into_iter()))
    }

    fn items(&self) -> StoreResult<Box<dyn Iterator<Item = StoreResult<(String, Value)>> + '_>> {
        let snapshot: Vec<(String, String)> = self
            .entries
            .read()
            .expect("lock poisoned")
            .iter()
            .map(|(key, document)| (key.clone(), document.clone()))
            .collect();

        let audit = self.options.audit;
        let algorithm = self.options.data_hash;
        Ok(Box::new(snapshot.into_iter().filter_map(
            move |(key, document)| {
                if audit {
                    let computed = algorithm.digest_hex(document.as_bytes());
                    if computed != key {
                        return Some(Err(StoreError::AuditFailure { key, computed }));
                    }
                }
                match serde_json::from_str(&document) {
                    Ok(value) => Some(Ok((key, value))),
                    Err(error) => {
                        warn!(%key, %error, "skipping undecodable document");
                        None
                    }
                }
            },
        )))
    }

    fn sync(&self) -> StoreResult<()> {
        Ok(())
    }

    fn delete_everything(&self) -> StoreResult<()> {
        self.entries.write().expect("lock poisoned").clear();
        Ok(())
    }
}
