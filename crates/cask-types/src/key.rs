use crate::error::KeyError;
use crate::hash::HashAlgorithm;

/// Returns `true` if `key` has the exact digest length for `algo` and is
/// entirely lowercase hex.
pub fn is_valid_key(key: &str, algo: HashAlgorithm) -> bool {
    key.len() == algo.hex_len() && key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Validate a key before any I/O is attempted.
///
/// Keys are lowercase hex digests; anything else is rejected up front so a
/// malformed key can never name a path or table row.
pub fn validate_key(key: &str, algo: HashAlgorithm) -> Result<(), KeyError> {
    if key.len() != algo.hex_len() {
        return Err(KeyError::InvalidLength {
            expected: algo.hex_len(),
            actual: key.len(),
        });
    }
    if !key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(KeyError::InvalidCharset(key.to_string()));
    }
    Ok(())
}
