//! Custody Ledger
//!
//! Maintains a tamper-evident, hash-linked custody history per event.
//! Appends to one event are serialized in-process by a per-event writer
//! lock and across processes by the store's tail compare-and-swap; appends
//! to different events run in parallel. Reads take no lock and observe some
//! committed prefix of the chain.

mod entry;
mod verify;

pub use entry::{
    timestamp_format, CustodyAction, CustodyEntry, EntryDraft, EntryId, ParseEntryIdError,
    UnknownAction, DEFAULT_ACTOR_TYPE, GENESIS,
};
pub use verify::{verify_entries, BreakReason, ChainBreak, ChainVerification};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::storage::{with_deadline, CustodyStore, StorageError};

/// Ledger configuration
#[derive(Clone, Debug)]
pub struct LedgerConfig {
    /// Upper bound on any single storage call
    pub storage_timeout: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            storage_timeout: Duration::from_secs(5),
        }
    }
}

/// Why an externally produced entry was refused
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportRejection {
    UnknownAction,
    NonCanonicalTimestamp,
    OutOfSequence { expected: String },
    LinkMismatch,
    HashMismatch,
}

impl fmt::Display for ImportRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportRejection::UnknownAction => f.write_str("action is not a custody action"),
            ImportRejection::NonCanonicalTimestamp => {
                f.write_str("timestamp is not in YYYY-MM-DDTHH:MM:SS.ffffffZ form")
            }
            ImportRejection::OutOfSequence { expected } => {
                write!(f, "entry is out of sequence, expected {}", expected)
            }
            ImportRejection::LinkMismatch => f.write_str("previous_hash does not match chain tail"),
            ImportRejection::HashMismatch => f.write_str("entry_hash does not match content"),
        }
    }
}

#[derive(Error, Debug)]
pub enum CustodyError {
    #[error("No custody entries found for event {0}")]
    ChainNotFound(String),
    #[error("Custody storage failure: {0}")]
    StorageFailure(#[from] StorageError),
    #[error("Custody entry {entry_id} rejected: {reason}")]
    Rejected {
        entry_id: String,
        reason: ImportRejection,
    },
    #[error("Event id must not be empty")]
    InvalidEventId,
    #[error("Custody entry could not be canonicalized: {0}")]
    Canonicalization(#[from] serde_json::Error),
}

impl CustodyError {
    /// Whether the caller may retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, CustodyError::StorageFailure(e) if e.is_retryable())
    }
}

/// Append-only, hash-linked custody history per event
pub struct CustodyLedger {
    store: Arc<dyn CustodyStore>,
    config: LedgerConfig,
    writers: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CustodyLedger {
    /// Create a ledger over the given store
    pub fn new(store: Arc<dyn CustodyStore>, config: LedgerConfig) -> Self {
        Self {
            store,
            config,
            writers: Mutex::new(HashMap::new()),
        }
    }

    /// Append a new entry to the event's chain
    pub async fn append(
        &self,
        event_id: &str,
        action: CustodyAction,
        actor: &str,
        location: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<CustodyEntry, CustodyError> {
        self.append_entry(EntryDraft::new(event_id, action, actor, location, timestamp))
            .await
    }

    /// Append a draft, linking it to the current tail
    pub async fn append_entry(&self, draft: EntryDraft) -> Result<CustodyEntry, CustodyError> {
        if draft.event_id.is_empty() {
            return Err(CustodyError::InvalidEventId);
        }
        let event_id = draft.event_id.clone();

        let writer = self.writer(&event_id).await;
        let result = {
            let _guard = writer.lock().await;
            self.link_and_store(draft).await
        };
        self.release_writer(&event_id, writer).await;

        let entry = result?;
        info!(
            event_id = %entry.event_id,
            entry_id = %entry.entry_id,
            action = %entry.action,
            "Appended custody entry"
        );
        Ok(entry)
    }

    /// Accept an entry produced elsewhere, e.g. by the collecting edge device
    ///
    /// The entry must use a known action and the fixed timestamp rendering,
    /// extend the current tail exactly, and its hash must recompute; it is
    /// never relinked or rehashed.
    pub async fn import(&self, entry: CustodyEntry) -> Result<CustodyEntry, CustodyError> {
        if entry.event_id.is_empty() {
            return Err(CustodyError::InvalidEventId);
        }
        let event_id = entry.event_id.clone();

        let writer = self.writer(&event_id).await;
        let result = {
            let _guard = writer.lock().await;
            self.check_and_store(entry).await
        };
        self.release_writer(&event_id, writer).await;

        let entry = result?;
        info!(
            event_id = %entry.event_id,
            entry_id = %entry.entry_id,
            actor = %entry.actor,
            "Imported custody entry"
        );
        Ok(entry)
    }

    /// Full chain for an event in insertion order
    pub async fn chain(&self, event_id: &str) -> Result<Vec<CustodyEntry>, CustodyError> {
        Ok(self.bounded(self.store.list_entries(event_id)).await?)
    }

    /// Verify the event's chain
    pub async fn verify(&self, event_id: &str) -> Result<ChainVerification, CustodyError> {
        let entries = self.chain(event_id).await?;
        if entries.is_empty() {
            return Err(CustodyError::ChainNotFound(event_id.to_string()));
        }

        let report = verify_entries(&entries);
        if report.valid {
            debug!(event_id, chain_length = report.chain_length, "Custody chain verified");
        } else {
            warn!(
                event_id,
                chain_length = report.chain_length,
                broken_at = ?report.broken_at,
                findings = report.breaks.len(),
                "Custody chain BROKEN"
            );
        }
        Ok(report)
    }

    async fn link_and_store(&self, draft: EntryDraft) -> Result<CustodyEntry, CustodyError> {
        let tail = self.bounded(self.store.tail(&draft.event_id)).await?;
        let (entry_id, previous_hash) = next_link(tail.as_ref())?;

        let entry = draft.link(entry_id, previous_hash)?;
        self.bounded(self.store.append_entry(&entry)).await?;
        Ok(entry)
    }

    async fn check_and_store(&self, entry: CustodyEntry) -> Result<CustodyEntry, CustodyError> {
        let reject = |reason| CustodyError::Rejected {
            entry_id: entry.entry_id.clone(),
            reason,
        };

        if entry.parsed_action().is_none() {
            return Err(reject(ImportRejection::UnknownAction));
        }
        if entry.recorded_at().is_none() {
            return Err(reject(ImportRejection::NonCanonicalTimestamp));
        }

        let tail = self.bounded(self.store.tail(&entry.event_id)).await?;
        let (entry_id, previous_hash) = next_link(tail.as_ref())?;
        if entry.entry_id != entry_id.to_string() {
            return Err(reject(ImportRejection::OutOfSequence {
                expected: entry_id.to_string(),
            }));
        }
        if entry.previous_hash != previous_hash {
            return Err(reject(ImportRejection::LinkMismatch));
        }
        if !entry.hash_matches() {
            return Err(reject(ImportRejection::HashMismatch));
        }

        self.bounded(self.store.append_entry(&entry)).await?;
        Ok(entry)
    }

    async fn bounded<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        with_deadline(self.config.storage_timeout, call).await
    }

    async fn writer(&self, event_id: &str) -> Arc<Mutex<()>> {
        let mut writers = self.writers.lock().await;
        writers.entry(event_id.to_string()).or_default().clone()
    }

    async fn release_writer(&self, event_id: &str, writer: Arc<Mutex<()>>) {
        let mut writers = self.writers.lock().await;
        // Only the map and this handle left
        if Arc::strong_count(&writer) == 2 {
            writers.remove(event_id);
        }
    }

    #[cfg(test)]
    async fn writer_count(&self) -> usize {
        self.writers.lock().await.len()
    }
}

/// Id and predecessor hash for the entry following `tail`
fn next_link(tail: Option<&CustodyEntry>) -> Result<(EntryId, String), StorageError> {
    match tail {
        None => Ok((EntryId::FIRST, GENESIS.to_string())),
        Some(tail) => {
            let id: EntryId = tail
                .entry_id
                .parse()
                .map_err(|e: ParseEntryIdError| StorageError::Corrupt(e.to_string()))?;
            Ok((id.next(), tail.entry_hash.clone()))
        }
    }
}
