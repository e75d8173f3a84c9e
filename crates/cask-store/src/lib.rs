//! Content-addressable JSON object store.
//!
//! Documents are JSON strings keyed by the hex digest of their content
//! (SHA-224 by default), partitioned into named buckets. Because the key is
//! derived from the bytes, documents are immutable: a repeated `put` is a
//! no-op and stored content is never overwritten.
//!
//! # Storage Backends
//!
//! All backends implement the [`Bucket`] trait:
//!
//! - [`FilesystemBucket`] -- one file per document, sharded by key prefix
//! - [`RelationalBucket`] -- one SQLite table per bucket, buckets on the
//!   same file share a connection and commit together
//! - [`MemoryBucket`] -- `HashMap`-based bucket for tests and embedding
//!
//! The [`Store`] facade owns a set of buckets on one backend, discovers
//! buckets already present in storage, and fans `sync()` out across them.
//!
//! # Queries
//!
//! [`Bucket::equality_query`] matches [`Filter`] path expressions (with `*`
//! wildcards) against the parsed documents, combined with [`Combine::And`]
//! or [`Combine::Or`]. Matching is built entirely on document enumeration,
//! so it behaves identically on every backend.
//!
//! # Design Rules
//!
//! 1. Keys are validated before any I/O; a malformed key is a caller error.
//! 2. "Not found", "already exists" and "already absent" are expected
//!    conditions, never errors.
//! 3. Writes are buffered by default; durability is an explicit `sync()`.
//! 4. Undecodable stored entries are logged and skipped during enumeration;
//!    audit mismatches (content no longer hashing to its key) are fatal.

pub mod bucket;
pub mod error;
pub mod filesystem;
pub mod memory;
pub mod options;
pub mod query;
pub mod relational;
pub mod store;

pub use bucket::Bucket;
pub use error::{StoreError, StoreResult};
pub use filesystem::FilesystemBucket;
pub use memory::MemoryBucket;
pub use options::StoreOptions;
pub use query::{Combine, Filter, MatchMap};
pub use relational::{ConnectionRegistry, RelationalBucket, RelationalInstance};
pub use store::{Backend, Store};
