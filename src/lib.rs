//! Custody Vault - crash evidence intake with a verifiable chain of custody
//!
//! Two guarantees hold even when storage and transport are only partly
//! trusted:
//! - Evidence is confidential: edge devices seal it with AES-256-GCM and
//!   anything altered in transit is rejected before a byte is revealed
//! - Custody history is tamper-evident: every custody action is a SHA-256
//!   hash-linked entry, and a chain can be re-verified at any time
//!
//! The cipher and the ledger are independent; [`ingest::EvidenceIngestor`]
//! composes them for an upload.

pub mod config;
pub mod crypto;
pub mod custody;
pub mod evidence;
pub mod ingest;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigError, Settings};
pub use crypto::{CipherError, EntryHash, EvidenceCipher, EvidenceKey};
pub use custody::{
    ChainVerification, CustodyAction, CustodyEntry, CustodyError, CustodyLedger, EntryDraft,
    LedgerConfig, GENESIS,
};
pub use evidence::{EvidenceRecord, PayloadError};
pub use ingest::{EvidenceBundle, EvidenceIngestor, IngestError, IngestReceipt, Upload};
pub use storage::{CustodyStore, EvidenceStore, MemoryStore, SledStore, StorageError};
