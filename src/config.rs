//! Process settings
//!
//! Values arrive from the command line or its environment fallbacks
//! (`CUSTODY_DATA_DIR`, `AES_ENCRYPTION_KEY`, `STORAGE_TIMEOUT_MS`) and are
//! validated here once, so the components receive typed values.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::crypto::{EvidenceCipher, EvidenceKey, KeyError};
use crate::custody::LedgerConfig;

pub const DEFAULT_STORAGE_TIMEOUT_MS: u64 = 5_000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("AES_ENCRYPTION_KEY is not set")]
    MissingKey,
    #[error("AES_ENCRYPTION_KEY is invalid: {0}")]
    InvalidKey(#[from] KeyError),
    #[error("storage timeout must be greater than zero")]
    ZeroTimeout,
}

/// Validated process settings
#[derive(Clone, Debug)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub storage_timeout: Duration,
    evidence_key: Option<EvidenceKey>,
}

impl Settings {
    /// Validate raw settings
    ///
    /// The key may be absent; only commands that touch ciphertext need it.
    pub fn new(
        data_dir: PathBuf,
        evidence_key_hex: Option<&str>,
        storage_timeout_ms: u64,
    ) -> Result<Self, ConfigError> {
        if storage_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        let evidence_key = evidence_key_hex.map(EvidenceKey::from_hex).transpose()?;

        Ok(Self {
            data_dir,
            storage_timeout: Duration::from_millis(storage_timeout_ms),
            evidence_key,
        })
    }

    /// Platform data directory, falling back to the working directory
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("custody-vault")
    }

    /// Cipher over the configured key
    pub fn cipher(&self) -> Result<EvidenceCipher, ConfigError> {
        self.evidence_key
            .clone()
            .map(EvidenceCipher::new)
            .ok_or(ConfigError::MissingKey)
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            storage_timeout: self.storage_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_without_key() {
        let settings = Settings::new(PathBuf::from("/tmp/x"), None, 250).unwrap();
        assert_eq!(settings.storage_timeout, Duration::from_millis(250));
        assert_eq!(settings.ledger_config().storage_timeout, Duration::from_millis(250));
        assert!(matches!(settings.cipher(), Err(ConfigError::MissingKey)));
    }

    #[test]
    fn test_settings_with_key() {
        let key = "ab".repeat(32);
        let settings = Settings::new(PathBuf::from("."), Some(&key), 1).unwrap();
        let cipher = settings.cipher().unwrap();
        let blob = cipher.seal(b"{}").unwrap();
        assert_eq!(cipher.decrypt(&blob).unwrap(), b"{}");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert_eq!(
            Settings::new(PathBuf::from("."), Some("short"), 1).unwrap_err(),
            ConfigError::InvalidKey(KeyError::InvalidLength {
                expected: 64,
                found: 5
            })
        );
        assert_eq!(
            Settings::new(PathBuf::from("."), None, 0).unwrap_err(),
            ConfigError::ZeroTimeout
        );
    }

    #[test]
    fn test_default_data_dir_is_namespaced() {
        assert!(Settings::default_data_dir().ends_with("custody-vault"));
    }
}
