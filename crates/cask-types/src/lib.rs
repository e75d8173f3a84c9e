//! Key and hash primitives for the cask content-addressable JSON store.
//!
//! Every stored document is identified by a lowercase hexadecimal digest of
//! its canonical UTF-8 string form. This crate defines the supported digest
//! algorithms ([`HashAlgorithm`], default SHA-224) and the validation rules
//! a key must satisfy before any storage backend touches it.

pub mod error;
pub mod hash;
pub mod key;

pub use error::KeyError;
pub use hash::HashAlgorithm;
pub use key::{is_valid_key, validate_key};
