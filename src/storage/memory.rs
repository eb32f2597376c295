//! In-memory storage
//!
//! Entries live in one arena; each event keeps the arena positions of its
//! chain plus the tail's ordinal and hash, so appends never walk a chain.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{check_extends, CustodyStore, EvidenceStore, StorageError};
use crate::custody::CustodyEntry;
use crate::evidence::EvidenceRecord;

#[derive(Default)]
struct ChainIndex {
    positions: Vec<usize>,
    tail_ordinal: u64,
    tail_hash: String,
}

#[derive(Default)]
struct Inner {
    arena: Vec<CustodyEntry>,
    chains: HashMap<String, ChainIndex>,
    evidence: HashMap<String, EvidenceRecord>,
}

/// Process-local store, used for tests and ephemeral runs
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of custody entries across all events
    pub async fn entry_count(&self) -> usize {
        self.inner.read().await.arena.len()
    }

    /// Mutate a stored entry in place, bypassing the chain checks
    #[cfg(test)]
    pub(crate) async fn tamper(
        &self,
        event_id: &str,
        position: usize,
        mutate: impl FnOnce(&mut CustodyEntry),
    ) {
        let mut inner = self.inner.write().await;
        let slot = inner.chains[event_id].positions[position];
        mutate(&mut inner.arena[slot]);
    }

    /// Swap two entries of a chain in storage order
    #[cfg(test)]
    pub(crate) async fn swap(&self, event_id: &str, a: usize, b: usize) {
        let mut inner = self.inner.write().await;
        if let Some(chain) = inner.chains.get_mut(event_id) {
            chain.positions.swap(a, b);
        }
    }
}

#[async_trait]
impl CustodyStore for MemoryStore {
    async fn tail(&self, event_id: &str) -> Result<Option<CustodyEntry>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .chains
            .get(event_id)
            .and_then(|chain| chain.positions.last())
            .map(|&slot| inner.arena[slot].clone()))
    }

    async fn append_entry(&self, entry: &CustodyEntry) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;

        let tail = inner
            .chains
            .get(&entry.event_id)
            .map(|chain| (chain.tail_ordinal, chain.tail_hash.as_str()));
        let ordinal = check_extends(tail, entry)?;

        let slot = inner.arena.len();
        inner.arena.push(entry.clone());

        let chain = inner.chains.entry(entry.event_id.clone()).or_default();
        chain.positions.push(slot);
        chain.tail_ordinal = ordinal;
        chain.tail_hash = entry.entry_hash.clone();

        Ok(())
    }

    async fn list_entries(&self, event_id: &str) -> Result<Vec<CustodyEntry>, StorageError> {
        let inner = self.inner.read().await;
        Ok(inner
            .chains
            .get(event_id)
            .map(|chain| {
                chain
                    .positions
                    .iter()
                    .map(|&slot| inner.arena[slot].clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl EvidenceStore for MemoryStore {
    async fn put(&self, event_id: &str, record: &EvidenceRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.write().await;
        match inner.evidence.get(event_id) {
            Some(existing) if existing == record => Ok(()),
            Some(_) => Err(StorageError::Conflict(event_id.to_string())),
            None => {
                inner.evidence.insert(event_id.to_string(), record.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, event_id: &str) -> Result<Option<EvidenceRecord>, StorageError> {
        Ok(self.inner.read().await.evidence.get(event_id).cloned())
    }
}
