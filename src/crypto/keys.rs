//! Evidence key handling
//!
//! The edge fleet and the cloud share one AES-256 key, distributed as a
//! 64-character hex string. The key is held in memory only for as long as
//! the owning cipher lives and is zeroed when dropped.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of an AES-256 key in bytes
pub const KEY_LEN: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    #[error("evidence key must be {expected} hex characters, got {found}")]
    InvalidLength { expected: usize, found: usize },
    #[error("evidence key is not valid hex")]
    InvalidHex,
}

/// Shared 256-bit evidence encryption key
/// Automatically zeroed when dropped
#[derive(Clone, ZeroizeOnDrop)]
pub struct EvidenceKey {
    key: [u8; KEY_LEN],
}

impl EvidenceKey {
    /// Wrap raw key bytes
    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Parse a key from its 64-character hex form
    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let s = s.trim();
        if s.len() != KEY_LEN * 2 {
            return Err(KeyError::InvalidLength {
                expected: KEY_LEN * 2,
                found: s.len(),
            });
        }

        let mut key = [0u8; KEY_LEN];
        if hex::decode_to_slice(s, &mut key).is_err() {
            key.zeroize();
            return Err(KeyError::InvalidHex);
        }
        Ok(Self { key })
    }

    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Get raw key bytes (use carefully)
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }

    /// Hex form, for provisioning edge devices
    pub fn to_hex(&self) -> String {
        hex::encode(self.key)
    }
}

impl fmt::Debug for EvidenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EvidenceKey(..)")
    }
}
