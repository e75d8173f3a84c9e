use serde_json::Value;

use crate::error::{StoreError, StoreResult};
use crate::query::{self, Combine, Filter, MatchMap};

/// A named, invariant partition of the key space.
///
/// All implementations must satisfy these invariants:
/// - Documents are immutable once stored. A second `put` under an existing
///   key is an idempotent no-op; the stored bytes never change.
/// - Keys are lowercase hex digests of the configured length; malformed
///   keys are rejected before any I/O is attempted.
/// - "Not found", "already exists" and "already absent" are expected
///   conditions, never errors.
/// - `keys()` and `items()` re-scan storage on every call; order is
///   unspecified. Entries that cannot be decoded are logged and skipped.
/// - After `sync()` returns, a crash cannot lose any `put` or `delete`
///   issued before the call.
pub trait Bucket {
    /// The bucket's name (its document type).
    fn name(&self) -> &str;

    /// Sub-key each equality query is scoped to.
    fn query_root(&self) -> &str;

    /// Read the raw document stored under `key`. `Ok(None)` on miss.
    fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Store a document, computing the content key when `key` is not
    /// supplied. Returns the (possibly pre-existing) key.
    fn put(&self, document: &str, key: Option<&str>) -> StoreResult<String>;

    /// Whether `key` currently has a stored document.
    fn contains(&self, key: &str) -> StoreResult<bool>;

    /// Remove the entry for `key`. Absent is success.
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// All keys currently stored. Finite and restartable: each call
    /// re-scans the backing storage.
    fn keys(&self) -> StoreResult<Box<dyn Iterator<Item = String> + '_>>;

    /// All `(key, parsed document)` pairs. Undecodable entries are warned
    /// and skipped; an audit mismatch is yielded as an error.
    fn items(&self) -> StoreResult<Box<dyn Iterator<Item = StoreResult<(String, Value)>> + '_>>;

    /// Flush buffered writes to durable storage.
    fn sync(&self) -> StoreResult<()>;

    /// Whether `sync()` on this bucket durably syncs every bucket sharing
    /// the same storage (true for buckets sharing one database file).
    fn sync_is_shared(&self) -> bool {
        false
    }

    /// Irreversibly remove the bucket and everything in it.
    fn delete_everything(&self) -> StoreResult<()>;

    /// Find documents whose fields structurally match every filter (`And`)
    /// or any filter (`Or`).
    ///
    /// Shared across backends: built entirely on `items()`. Documents that
    /// fail to parse have already been skipped by the iterator. Yields
    /// `(key, matched locations)` for each document with a non-empty
    /// combined match.
    fn equality_query(
        &self,
        filters: &[Filter],
        combine: Combine,
    ) -> StoreResult<Vec<(String, MatchMap)>> {
        if filters.is_empty() {
            return Err(StoreError::EmptyQuery);
        }

        let mut results = Vec::new();
        for entry in self.items()? {
            let (key, document) = entry?;
            let Some(scope) = query::scope(&document, self.query_root()) else {
                continue;
            };

            let mut per_filter = Vec::with_capacity(filters.len());
            let mut unmatched = false;
            for filter in filters {
                let matches = query::filter_matches(scope, filter);
                if matches.is_empty() && combine == Combine::And {
                    unmatched = true;
                    break;
                }
                per_filter.push(matches);
            }
            if unmatched {
                continue;
            }

            let merged = query::combine_matches(per_filter, combine);
            if !merged.is_empty() {
                results.push((key, merged));
            }
        }
        Ok(results)
    }
}
