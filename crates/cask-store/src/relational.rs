use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, warn};

use cask_types::validate_key;

use crate::bucket::Bucket;
use crate::error::{StoreError, StoreResult};
use crate::options::StoreOptions;

/// Every bucket table carries this prefix, which is also how pre-existing
/// buckets are discovered at connect time.
const TABLE_PREFIX: &str = "bucket_";

/// Map a bucket name to a safe SQL identifier.
///
/// Anything outside `[A-Za-z0-9_]` becomes `_`; the fixed prefix keeps the
/// identifier from starting with a digit.
fn table_name(bucket: &str) -> String {
    let sanitized: String = bucket
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    format!("{TABLE_PREFIX}{sanitized}")
}

/// Shared handle to a [`RelationalInstance`].
pub type RelationalHandle = Arc<Mutex<RelationalInstance>>;

/// One SQLite connection per database file, shared by every bucket backed
/// by that file.
///
/// The instance holds at most one deferred transaction open at a time:
/// `BEGIN DEFERRED` is issued lazily before the first mutation after the
/// last commit, and `commit()` (a bucket's `sync()`) ends it durably. All
/// buckets on the same file therefore share commit boundaries.
pub struct RelationalInstance {
    conn: Connection,
    in_transaction: bool,
    tables: HashSet<String>,
}

impl RelationalInstance {
    /// Open the database file, discovering any bucket tables it already
    /// contains.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let tables = Self::discover_tables(&conn)?;
        debug!(path = %path.display(), tables = tables.len(), "opened relational instance");
        Ok(Self {
            conn,
            in_transaction: false,
            tables,
        })
    }

    fn discover_tables(conn: &Connection) -> StoreResult<HashSet<String>> {
        // The underscore must be escaped: in LIKE it is a single-character
        // wildcard and would also match names like "bucketsX".
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name LIKE 'bucket\\_%' ESCAPE '\\'",
        )?;
        let tables = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(tables)
    }

    /// Names of every bucket this database file currently holds.
    pub fn bucket_names(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter_map(|table| table.strip_prefix(TABLE_PREFIX))
            .map(String::from)
            .collect()
    }

    /// Begin a deferred transaction if none is open.
    fn ensure_transaction(&mut self) -> StoreResult<()> {
        if !self.in_transaction {
            self.conn.execute_batch("BEGIN DEFERRED")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    /// Commit the open transaction, if any. The next mutation transparently
    /// begins a new one.
    pub fn commit(&mut self) -> StoreResult<()> {
        if self.in_transaction {
            self.conn.execute_batch("COMMIT")?;
            self.in_transaction = false;
            debug!("committed relational transaction");
        }
        Ok(())
    }

    fn ensure_table(&mut self, table: &str) -> StoreResult<()> {
        if self.tables.contains(table) {
            return Ok(());
        }
        self.ensure_transaction()?;
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} \
             (hash TEXT UNIQUE, data TEXT, current INTEGER DEFAULT 1)"
        ))?;
        self.tables.insert(table.to_string());
        debug!(%table, "created bucket table");
        Ok(())
    }

    fn put(&mut self, table: &str, key: &str, document: &str) -> StoreResult<()> {
        self.ensure_transaction()?;
        self.ensure_table(table)?;
        // Existence check pre-empts the UNIQUE violation: an existing key is
        // success and its row is left untouched.
        let existing: Option<i64> = self
            .conn
            .query_row(
                &format!("SELECT 1 FROM {table} WHERE hash = ?1"),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_none() {
            self.conn.execute(
                &format!("INSERT INTO {table} (hash, data) VALUES (?1, ?2)"),
                params![key, document],
            )?;
        }
        Ok(())
    }

    fn get(&self, table: &str, key: &str) -> StoreResult<Option<String>> {
        if !self.tables.contains(table) {
            return Ok(None);
        }
        let document = self
            .conn
            .query_row(
                &format!("SELECT data FROM {table} WHERE hash = ?1"),
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(document)
    }

    fn contains(&self, table: &str, key: &str) -> StoreResult<bool> {
        if !self.tables.contains(table) {
            return Ok(false);
        }
        let existing: Option<i64> = self
            .conn
            .query_row(
                &format!("SELECT 1 FROM {table} WHERE hash = ?1"),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(existing.is_some())
    }

    fn delete(&mut self, table: &str, key: &str) -> StoreResult<()> {
        if !self.tables.contains(table) {
            return Ok(());
        }
        self.ensure_transaction()?;
        // Zero rows affected means the key was already absent: success.
        self.conn.execute(
            &format!("DELETE FROM {table} WHERE hash = ?1"),
            params![key],
        )?;
        Ok(())
    }

    fn keys(&self, table: &str) -> StoreResult<Vec<String>> {
        if !self.tables.contains(table) {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(&format!("SELECT hash FROM {table}"))?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn rows(&self, table: &str) -> StoreResult<Vec<(String, String)>> {
        if !self.tables.contains(table) {
            return Ok(Vec::new());
        }
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT hash, data FROM {table}"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn drop_table(&mut self, table: &str) -> StoreResult<()> {
        self.ensure_transaction()?;
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {table}"))?;
        self.tables.remove(table);
        Ok(())
    }
}

/// Explicit registry handing out shared [`RelationalInstance`] handles,
/// one per database path.
///
/// Buckets built against the same path share one connection and one
/// transaction; committing through any of them commits them all. The
/// registry is an owned object (typically owned by the store facade), not a
/// process-wide global.
#[derive(Default)]
pub struct ConnectionRegistry {
    instances: Mutex<HashMap<PathBuf, RelationalHandle>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared instance for `path`, opening it on first request.
    pub fn handle(&self, path: &Path) -> StoreResult<RelationalHandle> {
        let mut instances = self.instances.lock().expect("lock poisoned");
        if let Some(handle) = instances.get(path) {
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(Mutex::new(RelationalInstance::open(path)?));
        instances.insert(path.to_path_buf(), Arc::clone(&handle));
        Ok(handle)
    }
}

/// Bucket persisting documents as rows of one table in a shared SQLite
/// file.
///
/// Columns are `(hash TEXT UNIQUE, data TEXT, current INTEGER DEFAULT 1)`
/// with the content key as the lookup column. `sync()` commits the shared
/// connection's transaction, which also commits every sibling bucket on the
/// same file ([`Bucket::sync_is_shared`] is `true`).
pub struct RelationalBucket {
    name: String,
    table: String,
    handle: RelationalHandle,
    options: StoreOptions,
}

impl RelationalBucket {
    /// Bind a bucket to its table on the shared instance. The table itself
    /// is created on the first successful `put`.
    pub fn open(handle: RelationalHandle, name: &str, options: StoreOptions) -> Self {
        Self {
            name: name.to_string(),
            table: table_name(name),
            handle,
            options,
        }
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

impl Bucket for RelationalBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_root(&self) -> &str {
        &self.options.query_root
    }

    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        validate_key(key, self.options.data_hash)?;
        let instance = self.handle.lock().expect("lock poisoned");
        match instance.get(&self.table, key)? {
            Some(document) => {
                self.audit_check(key, &document)?;
                Ok(Some(document))
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
        let mut instance = self.handle.lock().expect("lock poisoned");
        instance.put(&self.table, &key, document)?;
        Ok(key)
    }

    fn contains(&self, key: &str) -> StoreResult<bool> {
        validate_key(key, self.options.data_hash)?;
        let instance = self.handle.lock().expect("lock poisoned");
        instance.contains(&self.table, key)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key, self.options.data_hash)?;
        let mut instance = self.handle.lock().expect("lock poisoned");
        instance.delete(&self.table, key)
    }

    fn keys(&self) -> StoreResult<Box<dyn Iterator<Item = String> + '_>> {
        let keys = {
            let instance = self.handle.lock().expect("lock poisoned");
            instance.keys(&self.table)?
        };
        Ok(Box::new(keys.into_iter()))
    }

    fn items(&self) -> StoreResult<Box<dyn Iterator<Item = StoreResult<(String, Value)>> + '_>> {
        let rows = {
            let instance = self.handle.lock().expect("lock poisoned");
            instance.rows(&self.table)?
        };
        let audit = self.options.audit;
        let algorithm = self.options.data_hash;
        Ok(Box::new(rows.into_iter().filter_map(
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
        let mut instance = self.handle.lock().expect("lock poisoned");
        instance.commit()
    }

    fn sync_is_shared(&self) -> bool {
        true
    }

    fn delete_everything(&self) -> StoreResult<()> {
        let mut instance = self.handle.lock().expect("lock poisoned");
        instance.drop_table(&self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cask_types::{HashAlgorithm, KeyError};
    use serde_json::json;

    fn open_bucket(path: &Path, name: &str) -> (ConnectionRegistry, RelationalBucket) {
        let registry = ConnectionRegistry::new();
        let handle = registry.handle(path).unwrap();
        let bucket = RelationalBucket::open(handle, name, StoreOptions::default());
        (registry, bucket)
    }

    #[test]
    fn put_then_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cask.sqlite");
        let (_registry, bucket) = open_bucket(&path, "fileattrs");

        let doc = json!({"data": {"x": 1}}).to_string();
        let key = bucket.put(&doc, None).unwrap();
        assert_eq!(key, HashAlgorithm::Sha224.digest_hex(doc.as_bytes()));
        assert_eq!(bucket.get(&key).unwrap().as_deref(), Some(doc.as_str()));
    }

    #[test]
    fn put_is_idempotent_and_content_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cask.sqlite");
        let (_registry, bucket) = open_bucket(&path, "fileattrs");

        let key = "a".repeat(56);
        bucket.put("original", Some(&key)).unwrap();
        bucket.put("replacement", Some(&key)).unwrap();
        assert_eq!(bucket.get(&key).unwrap().as_deref(), Some("original"));
        assert_eq!(bucket.keys().unwrap().count(), 1);
    }

    #[test]
    fn get_before_first_put_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cask.sqlite");
        let (_registry, bucket) = open_bucket(&path, "untouched");
        let key = "0".repeat(56);
        assert_eq!(bucket.get(&key).unwrap(), None);
        assert!(!bucket.contains(&key).unwrap());
        assert_eq!(bucket.keys().unwrap().count(), 0);
    }

    #[test]
    fn malformed_key_rejected_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cask.sqlite");
        let (_registry, bucket) = open_bucket(&path, "fileattrs");
        let err = bucket.get("nope").unwrap_err();
        assert!(matches!(
            err,
            StoreError::Key(KeyError::InvalidLength { .. })
        ));
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cask.sqlite");
        let (_registry, bucket) = open_bucket(&path, "fileattrs");

        let key = bucket.put("{\"a\":1}", None).unwrap();
        bucket.delete(&key).unwrap();
        bucket.delete(&key).unwrap();
        assert!(!bucket.contains(&key).unwrap());
    }

    #[test]
    fn uncommitted_writes_invisible_to_other_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cask.sqlite");
        let (_registry, bucket) = open_bucket(&path, "fileattrs");

        let key = bucket.put("{\"a\":1}", None).unwrap();
        // Read-your-writes within the shared connection.
        assert!(bucket.contains(&key).unwrap());

        // An independent connection sees nothing until commit.
        let other = Connection::open(&path).unwrap();
        let tables: i64 = other
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE name = 'bucket_fileattrs'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 0);

        bucket.sync().unwrap();
        let rows: i64 = other
            .query_row("SELECT count(*) FROM bucket_fileattrs", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn sibling_buckets_share_commit_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cask.sqlite");
        let registry = ConnectionRegistry::new();
        let first = RelationalBucket::open(
            registry.handle(&path).unwrap(),
            "drives",
            StoreOptions::default(),
        );
        let second = RelationalBucket::open(
            registry.handle(&path).unwrap(),
            "mounts",
            StoreOptions::default(),
        );

        first.put("{\"d\":1}", None).unwrap();
        second.put("{\"m\":1}", None).unwrap();
        // Syncing one bucket commits both.
        first.sync().unwrap();

        let fresh = ConnectionRegistry::new();
        let instance = fresh.handle(&path).unwrap();
        let mut names = instance.lock().unwrap().bucket_names();
        names.sort();
        assert_eq!(names, vec!["drives", "mounts"]);
    }

    #[test]
    fn discovery_ignores_foreign_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cask.sqlite");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE bucketsX (id INTEGER); CREATE TABLE notes (id INTEGER)",
            )
            .unwrap();
        }

        let registry = ConnectionRegistry::new();
        let instance = registry.handle(&path).unwrap();
        assert!(instance.lock().unwrap().tables.is_empty());
    }

    #[test]
    fn bucket_names_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cask.sqlite");
        {
            let (_registry, bucket) = open_bucket(&path, "fileattrs");
            bucket.put("{\"a\":1}", None).unwrap();
            bucket.sync().unwrap();
        }

        let registry = ConnectionRegistry::new();
        let instance = registry.handle(&path).unwrap();
        assert_eq!(instance.lock().unwrap().bucket_names(), vec!["fileattrs"]);
    }

    #[test]
    fn registry_shares_one_instance_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cask.sqlite");
        let registry = ConnectionRegistry::new();
        let first = registry.handle(&path).unwrap();
        let second = registry.handle(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn table_names_are_sanitized() {
        assert_eq!(table_name("fileattrs"), "bucket_fileattrs");
        assert_eq!(table_name("net-config/v2"), "bucket_net_config_v2");
    }

    #[test]
    fn items_skip_undecodable_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cask.sqlite");
        let (_registry, bucket) = open_bucket(&path, "fileattrs");

        bucket.put("{\"ok\": true}", None).unwrap();
        bucket.put("{broken", Some(&"c".repeat(56))).unwrap();

        let items: Vec<(String, Value)> = bucket
            .items()
            .unwrap()
            .collect::<StoreResult<_>>()
            .unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn audit_detects_corrupted_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cask.sqlite");
        let registry = ConnectionRegistry::new();
        let handle = registry.handle(&path).unwrap();
        let options = StoreOptions {
            audit: true,
            ..StoreOptions::default()
        };
        let bucket = RelationalBucket::open(Arc::clone(&handle), "fileattrs", options);

        let key = bucket.put("{\"a\":1}", None).unwrap();
        // Corrupt the row behind the bucket's back.
        handle
            .lock()
            .unwrap()
            .conn
            .execute(
                "UPDATE bucket_fileattrs SET data = '{\"a\":2}' WHERE hash = ?1",
                params![key],
            )
            .unwrap();

        let err = bucket.get(&key).unwrap_err();
        assert!(matches!(err, StoreError::AuditFailure { .. }));
    }

    #[test]
    fn delete_everything_drops_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cask.sqlite");
        let (registry, bucket) = open_bucket(&path, "fileattrs");

        bucket.put("{\"a\":1}", None).unwrap();
        bucket.delete_everything().unwrap();
        bucket.sync().unwrap();

        let instance = registry.handle(&path).unwrap();
        assert!(instance.lock().unwrap().bucket_names().is_empty());
    }
}
