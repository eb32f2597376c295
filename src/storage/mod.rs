//! Storage module for custody chains and decrypted evidence
//!
//! The ledger and the ingestor only see the traits below. Two backends are
//! provided: sled for persistence and an in-memory arena.

pub mod memory;
pub mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::custody::{CustodyEntry, EntryId, GENESIS};
use crate::evidence::EvidenceRecord;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Chain tail for event {event_id} moved before the entry was written")]
    TailConflict { event_id: String },
    #[error("Evidence for event {0} already stored with different content")]
    Conflict(String),
    #[error("Storage operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Corrupt stored data: {0}")]
    Corrupt(String),
}

impl StorageError {
    /// Whether repeating the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Database(_) | StorageError::Timeout(_) | StorageError::TailConflict { .. }
        )
    }
}

/// Persistence of custody chains
///
/// `append_entry` must only succeed when the entry extends the current tail:
/// its `previous_hash` equals the tail's `entry_hash` (or `GENESIS` for an
/// empty chain) and its `entry_id` is the next ordinal. Otherwise it fails
/// with [`StorageError::TailConflict`] and stores nothing.
#[async_trait]
pub trait CustodyStore: Send + Sync {
    /// Last entry of the event's chain
    async fn tail(&self, event_id: &str) -> Result<Option<CustodyEntry>, StorageError>;

    /// Append an entry to its event's chain
    async fn append_entry(&self, entry: &CustodyEntry) -> Result<(), StorageError>;

    /// All entries of the event's chain in insertion order
    async fn list_entries(&self, event_id: &str) -> Result<Vec<CustodyEntry>, StorageError>;
}

/// Persistence of decrypted evidence records
#[async_trait]
pub trait EvidenceStore: Send + Sync {
    /// Store a record; storing an identical record again is a no-op
    async fn put(&self, event_id: &str, record: &EvidenceRecord) -> Result<(), StorageError>;

    async fn get(&self, event_id: &str) -> Result<Option<EvidenceRecord>, StorageError>;
}

/// Ordinal of `entry` if it extends the chain whose tail is `tail`
///
/// `tail` is the tail's ordinal and `entry_hash`, `None` for an empty chain.
pub(crate) fn check_extends(
    tail: Option<(u64, &str)>,
    entry: &CustodyEntry,
) -> Result<u64, StorageError> {
    let ordinal = entry
        .entry_id
        .parse::<EntryId>()
        .map_err(|e| StorageError::Corrupt(e.to_string()))?
        .ordinal();

    let (expected_ordinal, expected_prev) = match tail {
        None => (1, GENESIS),
        Some((last, hash)) => (last + 1, hash),
    };
    if ordinal != expected_ordinal || entry.previous_hash != expected_prev {
        return Err(StorageError::TailConflict {
            event_id: entry.event_id.clone(),
        });
    }
    Ok(ordinal)
}

/// Run a storage call under a deadline; expiry surfaces as a retryable error
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| StorageError::Timeout(deadline))?
}
