//! Evidence ingestion
//!
//! Composes the cipher, the evidence store and the custody ledger for one
//! upload: decrypt, validate, persist the record, take in the collecting
//! device's custody entry if one came along, then record the cloud receipt.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::crypto::{CipherError, EvidenceCipher};
use crate::custody::{
    verify_entries, ChainVerification, CustodyAction, CustodyEntry, CustodyError, CustodyLedger,
    EntryDraft,
};
use crate::evidence::{EvidenceRecord, PayloadError};
use crate::storage::{with_deadline, EvidenceStore, StorageError};

/// Actor recorded for the cloud receipt entry
pub const CLOUD_ACTOR: &str = "CLOUD_API";
/// Location recorded for the cloud receipt entry
pub const CLOUD_LOCATION: &str = "CLOUD_SERVER";

#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("Payload malformed: {0}")]
    PayloadMalformed(#[from] PayloadError),
    #[error(transparent)]
    Custody(#[from] CustodyError),
    #[error("Evidence storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("Evidence not found for event {0}")]
    NotFound(String),
}

impl IngestError {
    /// Whether the caller may retry the same upload
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Custody(e) => e.is_retryable(),
            IngestError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// One evidence upload
#[derive(Clone, Debug, Default)]
pub struct Upload {
    pub blob: Vec<u8>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    /// Custody entry written by the collecting device
    pub edge_custody: Option<CustodyEntry>,
}

/// Result of a successful upload
#[derive(Clone, Debug, Serialize)]
pub struct IngestReceipt {
    pub event_id: String,
    pub received_at: DateTime<Utc>,
    pub edge_entry_accepted: bool,
    pub custody_entry: CustodyEntry,
}

/// Stored evidence together with its custody history
#[derive(Clone, Debug, Serialize)]
pub struct EvidenceBundle {
    pub record: EvidenceRecord,
    pub custody_chain: Vec<CustodyEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<ChainVerification>,
}

/// Upload pipeline from encrypted blob to committed custody entry
pub struct EvidenceIngestor {
    cipher: EvidenceCipher,
    ledger: Arc<CustodyLedger>,
    evidence: Arc<dyn EvidenceStore>,
    storage_timeout: Duration,
}

impl EvidenceIngestor {
    pub fn new(
        cipher: EvidenceCipher,
        ledger: Arc<CustodyLedger>,
        evidence: Arc<dyn EvidenceStore>,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            cipher,
            ledger,
            evidence,
            storage_timeout,
        }
    }

    pub fn ledger(&self) -> &CustodyLedger {
        &self.ledger
    }

    /// Ingest one upload
    ///
    /// Safe to retry after a retryable failure: the record store accepts an
    /// identical record again and the receipt entry is only written last.
    pub async fn ingest(&self, upload: Upload) -> Result<IngestReceipt, IngestError> {
        let blob_len = upload.blob.len();

        let plaintext = self.cipher.decrypt(&upload.blob).map_err(|e| {
            match &e {
                CipherError::AuthenticationFailed => warn!(
                    target: "evidence::auth",
                    blob_len,
                    filename = ?upload.filename,
                    "Evidence authentication FAILED - tampered blob or wrong key"
                ),
                _ => info!(blob_len, "Rejected malformed evidence blob: {}", e),
            }
            e
        })?;

        let record = EvidenceRecord::from_plaintext(&plaintext).map_err(|e| {
            info!(blob_len, "Decrypted evidence payload malformed: {}", e);
            e
        })?;
        let event_id = record.event_id().to_string();

        with_deadline(self.storage_timeout, self.evidence.put(&event_id, &record)).await?;
        info!(
            event_id = %event_id,
            blob_len,
            telemetry = record.telemetry_len(),
            "Stored evidence record"
        );

        let edge_log_received = upload.edge_custody.is_some();
        let edge_entry_accepted = match upload.edge_custody {
            Some(entry) => self.accept_edge_entry(&event_id, entry).await,
            None => false,
        };

        let details = upload_details(
            upload.filename.as_deref(),
            blob_len,
            upload.content_type.as_deref(),
            edge_log_received,
        );
        let received_at = Utc::now();
        let custody_entry = self
            .ledger
            .append_entry(
                EntryDraft::new(
                    event_id.clone(),
                    CustodyAction::Transfer,
                    CLOUD_ACTOR,
                    CLOUD_LOCATION,
                    received_at,
                )
                .with_details(details),
            )
            .await?;

        Ok(IngestReceipt {
            event_id,
            received_at,
            edge_entry_accepted,
            custody_entry,
        })
    }

    /// Stored record, custody chain and its verification
    pub async fn lookup(&self, event_id: &str) -> Result<EvidenceBundle, IngestError> {
        lookup(&self.ledger, self.evidence.as_ref(), self.storage_timeout, event_id).await
    }

    /// The device's entry is advisory: a bad one is logged, not fatal
    async fn accept_edge_entry(&self, event_id: &str, entry: CustodyEntry) -> bool {
        if entry.event_id != event_id {
            warn!(
                event_id,
                edge_event_id = %entry.event_id,
                "Edge custody entry names a different event; ignored"
            );
            return false;
        }

        let entry_id = entry.entry_id.clone();
        match self.ledger.import(entry).await {
            Ok(_) => true,
            Err(e) => {
                warn!(event_id, entry_id = %entry_id, "Could not store edge custody entry: {}", e);
                false
            }
        }
    }
}

/// Read path shared with callers that hold no evidence key
pub async fn lookup(
    ledger: &CustodyLedger,
    evidence: &dyn EvidenceStore,
    storage_timeout: Duration,
    event_id: &str,
) -> Result<EvidenceBundle, IngestError> {
    let record = with_deadline(storage_timeout, evidence.get(event_id))
        .await?
        .ok_or_else(|| IngestError::NotFound(event_id.to_string()))?;

    let custody_chain = ledger.chain(event_id).await?;
    let verification = (!custody_chain.is_empty()).then(|| verify_entries(&custody_chain));

    Ok(EvidenceBundle {
        record,
        custody_chain,
        verification,
    })
}

fn upload_details(
    filename: Option<&str>,
    file_size: usize,
    content_type: Option<&str>,
    edge_log_received: bool,
) -> Map<String, Value> {
    let mut details = Map::new();
    details.insert(
        "upload_info".into(),
        json!({
            "filename": filename,
            "file_size": file_size,
            "content_type": content_type,
            "edge_log_received": edge_log_received,
        }),
    );
    details
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EvidenceKey;
    use crate::custody::{EntryId, LedgerConfig, GENESIS};
    use crate::storage::{MemoryStore, SledStore};
    use tempfile::tempdir;

    fn cipher() -> EvidenceCipher {
        EvidenceCipher::new(EvidenceKey::from_bytes([0x11; 32]))
    }

    fn ingestor_over(store: Arc<MemoryStore>) -> EvidenceIngestor {
        let ledger = Arc::new(CustodyLedger::new(store.clone(), LedgerConfig::default()));
        EvidenceIngestor::new(cipher(), ledger, store, Duration::from_secs(5))
    }

    fn crash_blob(event_id: &str) -> Vec<u8> {
        let payload = json!({
            "event_id": event_id,
            "timestamp": "2024-01-15T10:30:00Z",
            "crash_type": "frontal_impact_collision",
            "severity": "severe",
            "location": {"latitude": 12.97, "longitude": 77.59},
            "calculated_values": {"impact_force_g": 8.4},
            "metadata": {"device_id": "EDGE_DEVICE_V2"},
            "raw_data": [{"speed": 62.0}, {"speed": 0.0}]
        });
        cipher().seal(&serde_json::to_vec(&payload).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_ingest_stores_record_and_receipt() {
        let store = Arc::new(MemoryStore::new());
        let ingestor = ingestor_over(store.clone());

        let receipt = ingestor
            .ingest(Upload {
                blob: crash_blob("evt_1"),
                filename: Some("evt_1.bin".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(receipt.event_id, "evt_1");
        assert!(!receipt.edge_entry_accepted);
        assert_eq!(receipt.custody_entry.parsed_action(), Some(CustodyAction::Transfer));
        assert_eq!(
            receipt.custody_entry.details["upload_info"]["edge_log_received"],
            false
        );
        assert_eq!(receipt.custody_entry.actor, CLOUD_ACTOR);
        assert_eq!(receipt.custody_entry.previous_hash, GENESIS);
        assert_eq!(
            receipt.custody_entry.details["upload_info"]["filename"],
            "evt_1.bin"
        );

        let bundle = ingestor.lookup("evt_1").await.unwrap();
        assert_eq!(bundle.record.telemetry_len(), 2);
        assert_eq!(bundle.custody_chain.len(), 1);
        assert!(bundle.verification.unwrap().valid);
    }

    #[tokio::test]
    async fn test_edge_entry_precedes_cloud_receipt() {
        let store = Arc::new(MemoryStore::new());
        let ingestor = ingestor_over(store);

        let edge = EntryDraft::new(
            "evt_2",
            CustodyAction::EvidenceCollection,
            "EDGE_DEVICE_V2",
            "EDGE",
            Utc::now(),
        )
        .link(EntryId::FIRST, GENESIS)
        .unwrap();

        let receipt = ingestor
            .ingest(Upload {
                blob: crash_blob("evt_2"),
                edge_custody: Some(edge.clone()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(receipt.edge_entry_accepted);
        assert_eq!(receipt.custody_entry.entry_id, "custody_000002");
        assert_eq!(receipt.custody_entry.previous_hash, edge.entry_hash);

        let report = ingestor.ledger().verify("evt_2").await.unwrap();
        assert!(report.valid);
        assert_eq!(report.chain_length, 2);
    }

    #[tokio::test]
    async fn test_bad_edge_entry_is_not_fatal() {
        let ingestor = ingestor_over(Arc::new(MemoryStore::new()));

        let mut edge = EntryDraft::new(
            "evt_3",
            CustodyAction::EvidenceCollection,
            "EDGE_DEVICE_V2",
            "EDGE",
            Utc::now(),
        )
        .link(EntryId::FIRST, GENESIS)
        .unwrap();
        edge.location = "tampered".into();

        let receipt = ingestor
            .ingest(Upload {
                blob: crash_blob("evt_3"),
                edge_custody: Some(edge),
                ..Default::default()
            })
            .await
            .unwrap();

        // Received but refused: the receipt still records that a log came in
        assert!(!receipt.edge_entry_accepted);
        assert_eq!(receipt.custody_entry.entry_id, "custody_000001");
        assert_eq!(
            receipt.custody_entry.details["upload_info"]["edge_log_received"],
            true
        );
    }

    #[tokio::test]
    async fn test_failures_keep_their_kind() {
        let store = Arc::new(MemoryStore::new());
        let ingestor = ingestor_over(store.clone());

        let short = ingestor
            .ingest(Upload {
                blob: vec![0u8; 20],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            short,
            IngestError::Cipher(CipherError::MalformedInput { len: 20 })
        ));

        let mut tampered = crash_blob("evt_4");
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        let auth = ingestor
            .ingest(Upload {
                blob: tampered,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            auth,
            IngestError::Cipher(CipherError::AuthenticationFailed)
        ));
        assert!(!auth.is_retryable());

        let not_json = cipher().seal(b"not json at all").unwrap();
        let payload = ingestor
            .ingest(Upload {
                blob: not_json,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(payload, IngestError::PayloadMalformed(_)));

        // Nothing reached the ledger
        assert_eq!(store.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_lookup_unknown_event() {
        let ingestor = ingestor_over(Arc::new(MemoryStore::new()));
        assert!(matches!(
            ingestor.lookup("missing").await,
            Err(IngestError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reupload_extends_chain() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SledStore::open(dir.path()).unwrap());
        let ledger = Arc::new(CustodyLedger::new(store.clone(), LedgerConfig::default()));
        let ingestor = EvidenceIngestor::new(cipher(), ledger, store, Duration::from_secs(5));

        let blob = crash_blob("evt_5");
        for _ in 0..2 {
            ingestor
                .ingest(Upload {
                    blob: blob.clone(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let bundle = ingestor.lookup("evt_5").await.unwrap();
        assert_eq!(bundle.custody_chain.len(), 2);
        assert!(bundle.verification.unwrap().valid);
    }
}
