use thiserror::Error;

/// Errors produced by key validation and algorithm lookup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("invalid key length: expected {expected} hex characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("key is not lowercase hex: {0}")]
    InvalidCharset(String),
}
