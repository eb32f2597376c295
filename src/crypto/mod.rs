//! Cryptography module for evidence confidentiality and custody integrity
//!
//! Provides the shared evidence key, AES-256-GCM blob decryption and the
//! SHA-256 digests that link custody entries.

pub mod encryption;
pub mod hashing;
pub mod keys;

pub use encryption::{decrypt, seal, seal_with_nonce, CipherError, EvidenceCipher, HEADER_LEN};
pub use hashing::{EntryHash, HASH_ALGORITHM};
pub use keys::{EvidenceKey, KeyError};
