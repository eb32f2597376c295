//! Chain verification
//!
//! Walks a chain in insertion order and reports every break. A broken chain
//! is a normal outcome, not an error.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::entry::{CustodyEntry, GENESIS};

/// Why an entry failed verification
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakReason {
    /// First entry does not point at the sentinel
    GenesisMismatch,
    /// `previous_hash` differs from the predecessor's `entry_hash`
    LinkMismatch,
    /// Stored `entry_hash` differs from the recomputed one
    HashMismatch,
}

impl fmt::Display for BreakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakReason::GenesisMismatch => f.write_str("first entry must link to GENESIS"),
            BreakReason::LinkMismatch => f.write_str("previous_hash mismatch"),
            BreakReason::HashMismatch => f.write_str("entry has been tampered"),
        }
    }
}

/// One verification finding
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    /// Zero-based position in insertion order
    pub position: usize,
    pub entry_id: String,
    pub reason: BreakReason,
    pub expected: String,
    pub found: String,
}

/// Outcome of verifying one event's chain
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    /// Total number of stored entries, broken or not
    pub chain_length: usize,
    pub message: String,
    /// First offending entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breaks: Vec<ChainBreak>,
}

/// Verify an ordered chain
///
/// Every entry gets both the link check and the recompute check; the walk
/// never stops early.
pub fn verify_entries(entries: &[CustodyEntry]) -> ChainVerification {
    if entries.is_empty() {
        return ChainVerification {
            valid: false,
            chain_length: 0,
            message: "No custody entries found".to_string(),
            broken_at: None,
            breaks: Vec::new(),
        };
    }

    let mut breaks = Vec::new();

    for (position, entry) in entries.iter().enumerate() {
        let (expected_prev, reason) = match position {
            0 => (GENESIS, BreakReason::GenesisMismatch),
            _ => (
                entries[position - 1].entry_hash.as_str(),
                BreakReason::LinkMismatch,
            ),
        };
        if entry.previous_hash != expected_prev {
            breaks.push(ChainBreak {
                position,
                entry_id: entry.entry_id.clone(),
                reason,
                expected: expected_prev.to_string(),
                found: entry.previous_hash.clone(),
            });
        }

        let recomputed = entry
            .compute_hash()
            .map(|hash| hash.to_hex())
            .unwrap_or_default();
        if recomputed != entry.entry_hash {
            breaks.push(ChainBreak {
                position,
                entry_id: entry.entry_id.clone(),
                reason: BreakReason::HashMismatch,
                expected: recomputed,
                found: entry.entry_hash.clone(),
            });
        }
    }

    let chain_length = entries.len();
    match breaks.first() {
        None => ChainVerification {
            valid: true,
            chain_length,
            message: "Chain integrity verified successfully".to_string(),
            broken_at: None,
            breaks,
        },
        Some(first) => ChainVerification {
            valid: false,
            chain_length,
            message: format!(
                "Hash chain broken at entry {} ({}); {} finding(s)",
                first.entry_id,
                first.reason,
                breaks.len()
            ),
            broken_at: Some(first.entry_id.clone()),
            breaks,
        },
    }
}
