//! Local custody and evidence storage using sled embedded database
//!
//! Trees:
//! - `custody`: `len(event_id) u32 BE || event_id || ordinal u64 BE` → entry JSON
//! - `custody_tails`: `event_id` → `ordinal u64 BE || entry_hash`
//! - `evidence`: `event_id` → record JSON
//!
//! Entry and tail are written in one transaction, which is also where the
//! tail compare-and-swap happens.

use std::path::Path;

use async_trait::async_trait;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use tracing::{debug, info};

use super::{check_extends, CustodyStore, EvidenceStore, StorageError};
use crate::custody::CustodyEntry;
use crate::evidence::EvidenceRecord;

/// Persistent storage for custody chains and evidence
pub struct SledStore {
    db: Db,
    entries: Tree,
    tails: Tree,
    evidence: Tree,
}

fn chain_prefix(event_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + event_id.len() + 8);
    key.extend_from_slice(&(event_id.len() as u32).to_be_bytes());
    key.extend_from_slice(event_id.as_bytes());
    key
}

fn entry_key(event_id: &str, ordinal: u64) -> Vec<u8> {
    let mut key = chain_prefix(event_id);
    key.extend_from_slice(&ordinal.to_be_bytes());
    key
}

fn encode_tail(ordinal: u64, entry_hash: &str) -> Vec<u8> {
    let mut value = Vec::with_capacity(8 + entry_hash.len());
    value.extend_from_slice(&ordinal.to_be_bytes());
    value.extend_from_slice(entry_hash.as_bytes());
    value
}

fn decode_tail(value: &[u8]) -> Result<(u64, String), StorageError> {
    if value.len() < 8 {
        return Err(StorageError::Corrupt("truncated chain tail".into()));
    }
    let (ordinal, hash) = value.split_at(8);
    let ordinal = u64::from_be_bytes(ordinal.try_into().unwrap_or_default());
    let hash = String::from_utf8(hash.to_vec())
        .map_err(|_| StorageError::Corrupt("chain tail hash is not UTF-8".into()))?;
    Ok((ordinal, hash))
}

impl SledStore {
    /// Open or create the store at given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let entries = db.open_tree("custody")?;
        let tails = db.open_tree("custody_tails")?;
        let evidence = db.open_tree("evidence")?;

        info!(chains = tails.len(), records = evidence.len(), "Opened custody store");

        Ok(Self {
            db,
            entries,
            tails,
            evidence,
        })
    }

    /// Number of events with a custody chain
    pub fn chain_count(&self) -> usize {
        self.tails.len()
    }

    /// Number of stored evidence records
    pub fn evidence_count(&self) -> usize {
        self.evidence.len()
    }

    /// Bytes used on disk
    pub fn size_on_disk(&self) -> Result<u64, StorageError> {
        Ok(self.db.size_on_disk()?)
    }

    /// Flush changes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl CustodyStore for SledStore {
    async fn tail(&self, event_id: &str) -> Result<Option<CustodyEntry>, StorageError> {
        let Some(tail) = self.tails.get(event_id.as_bytes())? else {
            return Ok(None);
        };
        let (ordinal, _) = decode_tail(&tail)?;
        let raw = self
            .entries
            .get(entry_key(event_id, ordinal))?
            .ok_or_else(|| StorageError::Corrupt(format!("missing tail entry for {}", event_id)))?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    async fn append_entry(&self, entry: &CustodyEntry) -> Result<(), StorageError> {
        let value = serde_json::to_vec(entry)?;
        let event_id = entry.event_id.as_str();

        let outcome = (&self.entries, &self.tails).transaction(|(entries, tails)| {
            let tail = match tails.get(event_id.as_bytes())? {
                Some(raw) => {
                    Some(decode_tail(&raw).map_err(ConflictableTransactionError::Abort)?)
                }
                None => None,
            };
            let ordinal = check_extends(
                tail.as_ref().map(|(ordinal, hash)| (*ordinal, hash.as_str())),
                entry,
            )
            .map_err(ConflictableTransactionError::Abort)?;

            entries.insert(entry_key(event_id, ordinal), value.as_slice())?;
            tails.insert(event_id.as_bytes(), encode_tail(ordinal, &entry.entry_hash))?;
            Ok::<(), ConflictableTransactionError<StorageError>>(())
        });

        match outcome {
            Ok(()) => {
                debug!(event_id, entry_id = %entry.entry_id, "Stored custody entry");
                Ok(())
            }
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    async fn list_entries(&self, event_id: &str) -> Result<Vec<CustodyEntry>, StorageError> {
        let mut chain = Vec::new();
        // Ordinals are big-endian, so key order is insertion order
        for item in self.entries.scan_prefix(chain_prefix(event_id)) {
            let (_, raw) = item?;
            chain.push(serde_json::from_slice(&raw)?);
        }
        Ok(chain)
    }
}

#[async_trait]
impl EvidenceStore for SledStore {
    async fn put(&self, event_id: &str, record: &EvidenceRecord) -> Result<(), StorageError> {
        let value = serde_json::to_vec(record)?;
        let swapped = self.evidence.compare_and_swap(
            event_id.as_bytes(),
            None as Option<&[u8]>,
            Some(value.as_slice()),
        )?;

        match swapped {
            Ok(()) => Ok(()),
            Err(existing) if existing.current.as_deref() == Some(value.as_slice()) => Ok(()),
            Err(_) => Err(StorageError::Conflict(event_id.to_string())),
        }
    }

    async fn get(&self, event_id: &str) -> Result<Option<EvidenceRecord>, StorageError> {
        self.evidence
            .get(event_id.as_bytes())?
            .map(|raw| serde_json::from_slice(&raw).map_err(StorageError::from))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::{
        verify_entries, CustodyAction, CustodyLedger, EntryDraft, EntryId, LedgerConfig, GENESIS,
    };
    use std::sync::Arc;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::tempdir;

    fn linked(event_id: &str, id: EntryId, prev: &str) -> CustodyEntry {
        EntryDraft::new(event_id, CustodyAction::Transfer, "CLOUD_API", "CLOUD_SERVER", Utc::now())
            .link(id, prev)
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_and_list_in_order() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        let mut prev = GENESIS.to_string();
        let mut id = EntryId::FIRST;
        let mut expected = Vec::new();
        // Crosses the one-byte boundary of the ordinal encoding
        for _ in 0..300 {
            let entry = linked("evt_1", id, &prev);
            store.append_entry(&entry).await.unwrap();
            prev = entry.entry_hash.clone();
            id = id.next();
            expected.push(entry);
        }

        let listed = store.list_entries("evt_1").await.unwrap();
        assert_eq!(listed, expected);
        assert_eq!(store.tail("evt_1").await.unwrap().as_ref(), expected.last());
        assert!(verify_entries(&listed).valid);
    }

    #[tokio::test]
    async fn test_prefix_does_not_leak_between_events() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        store.append_entry(&linked("evt", EntryId::FIRST, GENESIS)).await.unwrap();
        store.append_entry(&linked("evt_2", EntryId::FIRST, GENESIS)).await.unwrap();

        assert_eq!(store.list_entries("evt").await.unwrap().len(), 1);
        assert_eq!(store.list_entries("evt_2").await.unwrap().len(), 1);
        assert_eq!(store.chain_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_tail_rejected() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        let first = linked("evt", EntryId::FIRST, GENESIS);
        store.append_entry(&first).await.unwrap();

        let fork = linked("evt", EntryId::FIRST, GENESIS);
        let err = store.append_entry(&fork).await.unwrap_err();
        assert!(matches!(err, StorageError::TailConflict { .. }));
        assert_eq!(store.list_entries("evt").await.unwrap(), vec![first]);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let first = linked("evt", EntryId::FIRST, GENESIS);
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.append_entry(&first).await.unwrap();
            store.flush().unwrap();
        }

        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(store.tail("evt").await.unwrap(), Some(first.clone()));

        let second = linked("evt", EntryId::FIRST.next(), &first.entry_hash);
        store.append_entry(&second).await.unwrap();
        assert_eq!(store.list_entries("evt").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_tampered_row_detected_on_verify() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        let first = linked("evt", EntryId::FIRST, GENESIS);
        store.append_entry(&first).await.unwrap();

        // Rewrite the row behind the store's back
        let mut forged = first.clone();
        forged.actor = "UNKNOWN".to_string();
        store
            .entries
            .insert(entry_key("evt", 1), serde_json::to_vec(&forged).unwrap())
            .unwrap();

        let report = verify_entries(&store.list_entries("evt").await.unwrap());
        assert!(!report.valid);
        assert_eq!(report.broken_at.as_deref(), Some("custody_000001"));
    }

    #[tokio::test]
    async fn test_rewritten_action_and_timestamp_reported_by_ledger() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SledStore::open(dir.path()).unwrap());
        let ledger = CustodyLedger::new(store.clone(), LedgerConfig::default());

        for action in [CustodyAction::EvidenceCollection, CustodyAction::Transfer] {
            ledger
                .append("evt", action, "CLOUD_API", "CLOUD_SERVER", Utc::now())
                .await
                .unwrap();
        }

        let rewrite = |ordinal: u64, field: &str, value: &str| {
            let raw = store.entries.get(entry_key("evt", ordinal)).unwrap().unwrap();
            let mut row: serde_json::Value = serde_json::from_slice(&raw).unwrap();
            row[field] = json!(value);
            store
                .entries
                .insert(entry_key("evt", ordinal), serde_json::to_vec(&row).unwrap())
                .unwrap();
        };
        rewrite(1, "action", "SHRED");

        let report = ledger.verify("evt").await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.chain_length, 2);
        assert_eq!(report.broken_at.as_deref(), Some("custody_000001"));

        // Restore the action, then move the timestamp to an equivalent instant
        rewrite(1, "action", "EVIDENCE_COLLECTION");
        let original = store.list_entries("evt").await.unwrap()[1].clone();
        assert!(ledger.verify("evt").await.unwrap().valid);

        let shifted = original
            .recorded_at()
            .unwrap()
            .with_timezone(&chrono::FixedOffset::east_opt(2 * 3600).unwrap())
            .to_rfc3339_opts(chrono::SecondsFormat::Nanos, false);
        rewrite(2, "timestamp", &shifted);

        let report = ledger.verify("evt").await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.broken_at.as_deref(), Some("custody_000002"));
    }

    #[tokio::test]
    async fn test_evidence_roundtrip_and_conflict() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        let record =
            EvidenceRecord::from_value(json!({"event_id": "evt", "crash_type": "rollover_event"}))
                .unwrap();
        store.put("evt", &record).await.unwrap();
        store.put("evt", &record).await.unwrap();
        assert_eq!(store.get("evt").await.unwrap(), Some(record));
        assert_eq!(store.evidence_count(), 1);

        let other =
            EvidenceRecord::from_value(json!({"event_id": "evt", "crash_type": "rear_end_collision"}))
                .unwrap();
        assert!(matches!(
            store.put("evt", &other).await,
            Err(StorageError::Conflict(_))
        ));
    }
}
