//! Authenticated decryption of edge evidence blobs using AES-256-GCM
//!
//! Wire format produced by edge devices (no header, no version byte):
//!
//! ```text
//! [0, 12)   nonce
//! [12, 28)  authentication tag
//! [28, ..)  ciphertext
//! ```
//!
//! No associated data is bound. Decryption is all-or-nothing: plaintext is
//! only handed out after the tag has been verified.

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

use super::keys::EvidenceKey;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Bytes preceding the ciphertext in a blob
pub const HEADER_LEN: usize = NONCE_LEN + TAG_LEN;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("evidence blob too short: {len} bytes, need more than {HEADER_LEN}")]
    MalformedInput { len: usize },
    #[error("evidence authentication failed - blob tampered or key incorrect")]
    AuthenticationFailed,
    #[error("encryption failed")]
    EncryptionFailed,
}

/// Decrypts uploaded evidence with a key fixed at construction
///
/// Holding the key here rather than in global state lets a process run
/// several ciphers side by side during key rotation.
#[derive(Clone)]
pub struct EvidenceCipher {
    key: EvidenceKey,
}

impl EvidenceCipher {
    pub fn new(key: EvidenceKey) -> Self {
        Self { key }
    }

    /// Authenticate and decrypt a blob
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CipherError> {
        decrypt(&self.key, blob)
    }

    /// Encrypt a payload the way edge devices do, with a random nonce
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        seal(&self.key, plaintext)
    }

    /// Encrypt with a caller-chosen nonce
    ///
    /// Reusing a nonce under the same key breaks GCM; this exists for
    /// reproducible test vectors.
    pub fn seal_with_nonce(
        &self,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CipherError> {
        seal_with_nonce(&self.key, nonce, plaintext)
    }
}

/// Decrypt an evidence blob with AES-256-GCM
pub fn decrypt(key: &EvidenceKey, blob: &[u8]) -> Result<Vec<u8>, CipherError> {
    // Nonce and tag alone carry no evidence
    if blob.len() <= HEADER_LEN {
        return Err(CipherError::MalformedInput { len: blob.len() });
    }

    let nonce = Nonce::from_slice(&blob[..NONCE_LEN]);
    let tag = Tag::from_slice(&blob[NONCE_LEN..HEADER_LEN]);
    let mut buffer = blob[HEADER_LEN..].to_vec();

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    match cipher.decrypt_in_place_detached(nonce, b"", &mut buffer, tag) {
        Ok(()) => Ok(buffer),
        Err(_) => {
            // The buffer may already hold keystream output; never let it escape
            buffer.zeroize();
            Err(CipherError::AuthenticationFailed)
        }
    }
}

/// Encrypt a payload with a fresh random nonce
///
/// Output format: nonce (12 bytes) || tag (16 bytes) || ciphertext
pub fn seal(key: &EvidenceKey, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    seal_with_nonce(key, &nonce, plaintext)
}

/// Encrypt a payload with the given nonce
pub fn seal_with_nonce(
    key: &EvidenceKey,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CipherError> {
    // An empty ciphertext would produce a blob that decrypt rejects
    if plaintext.is_empty() {
        return Err(CipherError::EncryptionFailed);
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let mut ciphertext = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(nonce), b"", &mut ciphertext)
        .map_err(|_| CipherError::EncryptionFailed)?;

    let mut blob = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    blob.extend_from_slice(nonce);
    blob.extend_from_slice(&tag);
    blob.extend_from_slice(&ciphertext);

    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> EvidenceKey {
        EvidenceKey::from_bytes([0x42; 32])
    }

    #[test]
    fn test_seal_decrypt_roundtrip() {
        let cipher = EvidenceCipher::new(test_key());
        let plaintext = br#"{"event_id":"evt_1","severity":"severe"}"#;

        let blob = cipher.seal(plaintext).unwrap();
        assert_eq!(blob.len(), HEADER_LEN + plaintext.len());

        let decrypted = cipher.decrypt(&blob).unwrap();
        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_known_vector() {
        // AES-256-GCM, zero key, zero IV, one zero block, no AAD
        let key = EvidenceKey::from_bytes([0u8; 32]);
        let blob = seal_with_nonce(&key, &[0u8; 12], &[0u8; 16]).unwrap();

        assert_eq!(hex::encode(&blob[..12]), "000000000000000000000000");
        assert_eq!(
            hex::encode(&blob[12..28]),
            "d0d1c8a799996bf0265b98b5d48ab919"
        );
        assert_eq!(
            hex::encode(&blob[28..]),
            "cea7403d4d606b6e074ec5d3baf39d18"
        );
        assert_eq!(decrypt(&key, &blob).unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = seal(&test_key(), b"secret").unwrap();
        let other = EvidenceKey::from_bytes([0x43; 32]);

        assert_eq!(
            decrypt(&other, &blob),
            Err(CipherError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_any_bit_flip_fails() {
        let key = test_key();
        let blob = seal_with_nonce(&key, &[9u8; 12], b"crash telemetry").unwrap();

        for byte in 0..blob.len() {
            for bit in 0..8 {
                let mut tampered = blob.clone();
                tampered[byte] ^= 1 << bit;
                assert_eq!(
                    decrypt(&key, &tampered),
                    Err(CipherError::AuthenticationFailed),
                    "flip at byte {} bit {} was accepted",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_short_blob_is_malformed() {
        let key = test_key();
        assert_eq!(
            decrypt(&key, &[0u8; 20]),
            Err(CipherError::MalformedInput { len: 20 })
        );
        // Header with no ciphertext is still malformed
        assert_eq!(
            decrypt(&key, &[0u8; 28]),
            Err(CipherError::MalformedInput { len: 28 })
        );
        assert_eq!(
            decrypt(&key, &[]),
            Err(CipherError::MalformedInput { len: 0 })
        );
    }

    #[test]
    fn test_truncated_ciphertext_fails_authentication() {
        let key = test_key();
        let blob = seal(&key, b"0123456789").unwrap();
        assert_eq!(
            decrypt(&key, &blob[..blob.len() - 1]),
            Err(CipherError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_decrypt_is_deterministic() {
        let key = test_key();
        let blob = seal(&key, b"same input").unwrap();
        assert_eq!(decrypt(&key, &blob), decrypt(&key, &blob));
    }

    #[test]
    fn test_empty_plaintext_not_sealed() {
        assert_eq!(seal(&test_key(), b""), Err(CipherError::EncryptionFailed));
    }
}
