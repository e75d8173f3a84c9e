use cask_types::KeyError;

/// Errors from store operations.
///
/// Expected local conditions (key not found, key already stored, entry
/// already deleted) are not errors; they are absorbed by the backends and
/// surfaced as `Ok` values. Everything here indicates a caller mistake, an
/// I/O failure, or storage corruption.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The supplied key is not a well-formed digest string.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Stored content no longer hashes to its key (storage corruption).
    #[error("audit failure for key {key}: stored content hashes to {computed}")]
    AuditFailure { key: String, computed: String },

    /// An equality query was issued with no filters.
    #[error("equality query requires at least one filter")]
    EmptyQuery,

    /// I/O error from the filesystem backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the relational backend.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
