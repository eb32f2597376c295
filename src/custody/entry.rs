//! Custody entries and their canonical hash input
//!
//! The hash of an entry covers the JSON object
//!
//! ```text
//! { action, actor, actor_type, details, entry_id, event_id,
//!   hash_algorithm, location, previous_hash, timestamp }
//! ```
//!
//! serialized with the JSON Canonicalization Scheme (RFC 8785) and encoded
//! as UTF-8. Every member is hashed exactly as stored; entries written here
//! render `timestamp` as `YYYY-MM-DDTHH:MM:SS.ffffffZ`. `entry_hash` is never
//! part of its own input.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::crypto::{EntryHash, HASH_ALGORITHM};

/// `previous_hash` of the first entry in every chain
pub const GENESIS: &str = "GENESIS";

/// Actor type recorded when none is given
pub const DEFAULT_ACTOR_TYPE: &str = "AUTOMATED_SYSTEM";

const ENTRY_ID_PREFIX: &str = "custody_";
const ENTRY_ID_WIDTH: usize = 6;

/// Custody-relevant activity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CustodyAction {
    EvidenceCollection,
    Transfer,
    Storage,
    Access,
    Verification,
    Modification,
    Export,
    Deletion,
}

impl CustodyAction {
    pub const ALL: [CustodyAction; 8] = [
        CustodyAction::EvidenceCollection,
        CustodyAction::Transfer,
        CustodyAction::Storage,
        CustodyAction::Access,
        CustodyAction::Verification,
        CustodyAction::Modification,
        CustodyAction::Export,
        CustodyAction::Deletion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CustodyAction::EvidenceCollection => "EVIDENCE_COLLECTION",
            CustodyAction::Transfer => "TRANSFER",
            CustodyAction::Storage => "STORAGE",
            CustodyAction::Access => "ACCESS",
            CustodyAction::Verification => "VERIFICATION",
            CustodyAction::Modification => "MODIFICATION",
            CustodyAction::Export => "EXPORT",
            CustodyAction::Deletion => "DELETION",
        }
    }
}

impl fmt::Display for CustodyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown custody action: {0}")]
pub struct UnknownAction(pub String);

impl FromStr for CustodyAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        CustodyAction::ALL
            .into_iter()
            .find(|action| action.as_str() == wanted)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

/// Position of an entry within its event's chain, rendered `custody_000001`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(u64);

impl EntryId {
    pub const FIRST: EntryId = EntryId(1);

    /// 1-based ordinal; zero is not a valid position
    pub fn new(ordinal: u64) -> Option<Self> {
        (ordinal > 0).then_some(Self(ordinal))
    }

    pub fn ordinal(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:0width$}", ENTRY_ID_PREFIX, self.0, width = ENTRY_ID_WIDTH)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("malformed custody entry id: {0}")]
pub struct ParseEntryIdError(pub String);

impl FromStr for EntryId {
    type Err = ParseEntryIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseEntryIdError(s.to_string());
        let digits = s.strip_prefix(ENTRY_ID_PREFIX).ok_or_else(err)?;
        if digits.len() < ENTRY_ID_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let id = digits
            .parse::<u64>()
            .ok()
            .and_then(EntryId::new)
            .ok_or_else(err)?;
        // Exactly one spelling per ordinal
        if id.to_string() != s {
            return Err(err());
        }
        Ok(id)
    }
}

/// Fixed rendering of entry timestamps
pub mod timestamp_format {
    use chrono::{DateTime, NaiveDateTime, Utc};

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

    pub fn render(ts: &DateTime<Utc>) -> String {
        ts.format(FORMAT).to_string()
    }

    /// Parse text in exactly the fixed rendering; anything else is `None`
    pub fn parse(text: &str) -> Option<DateTime<Utc>> {
        let ts = NaiveDateTime::parse_from_str(text, FORMAT).ok()?.and_utc();
        (render(&ts) == text).then_some(ts)
    }
}

/// One link in an event's custody chain
///
/// Every field is kept as the stored text, `action` and `timestamp`
/// included, so a tampered row still loads and shows up as a break during
/// verification. Use [`CustodyEntry::parsed_action`] and
/// [`CustodyEntry::recorded_at`] for typed values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustodyEntry {
    pub entry_id: String,
    pub timestamp: String,
    pub event_id: String,
    pub action: String,
    pub actor: String,
    #[serde(default = "default_actor_type")]
    pub actor_type: String,
    pub location: String,
    #[serde(default)]
    pub details: Map<String, Value>,
    pub previous_hash: String,
    pub entry_hash: String,
    #[serde(default = "default_hash_algorithm")]
    pub hash_algorithm: String,
}

fn default_actor_type() -> String {
    DEFAULT_ACTOR_TYPE.to_string()
}

fn default_hash_algorithm() -> String {
    HASH_ALGORITHM.to_string()
}

/// Borrowed view of exactly the fields covered by `entry_hash`
#[derive(Serialize)]
struct HashedFields<'a> {
    action: &'a str,
    actor: &'a str,
    actor_type: &'a str,
    details: &'a Map<String, Value>,
    entry_id: &'a str,
    event_id: &'a str,
    hash_algorithm: &'a str,
    location: &'a str,
    previous_hash: &'a str,
    timestamp: &'a str,
}

impl CustodyEntry {
    /// Canonical bytes fed to the hash function
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_jcs::to_vec(&HashedFields {
            action: &self.action,
            actor: &self.actor,
            actor_type: &self.actor_type,
            details: &self.details,
            entry_id: &self.entry_id,
            event_id: &self.event_id,
            hash_algorithm: &self.hash_algorithm,
            location: &self.location,
            previous_hash: &self.previous_hash,
            timestamp: &self.timestamp,
        })
    }

    /// Recompute the hash from the entry's own fields
    pub fn compute_hash(&self) -> Result<EntryHash, serde_json::Error> {
        Ok(EntryHash::digest(&self.canonical_bytes()?))
    }

    /// Whether the stored hash matches the entry's content
    pub fn hash_matches(&self) -> bool {
        self.compute_hash()
            .map(|hash| hash.to_hex() == self.entry_hash)
            .unwrap_or(false)
    }

    /// The action, if it is one of the known custody actions
    pub fn parsed_action(&self) -> Option<CustodyAction> {
        CustodyAction::ALL
            .into_iter()
            .find(|action| action.as_str() == self.action)
    }

    /// The timestamp, if it is in the fixed rendering
    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        timestamp_format::parse(&self.timestamp)
    }

    pub fn is_genesis(&self) -> bool {
        self.previous_hash == GENESIS
    }
}

/// Content of an entry before it is linked into a chain
#[derive(Clone, Debug)]
pub struct EntryDraft {
    pub event_id: String,
    pub action: CustodyAction,
    pub actor: String,
    pub actor_type: String,
    pub location: String,
    pub details: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl EntryDraft {
    pub fn new(
        event_id: impl Into<String>,
        action: CustodyAction,
        actor: impl Into<String>,
        location: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            action,
            actor: actor.into(),
            actor_type: DEFAULT_ACTOR_TYPE.to_string(),
            location: location.into(),
            details: Map::new(),
            timestamp,
        }
    }

    pub fn with_actor_type(mut self, actor_type: impl Into<String>) -> Self {
        self.actor_type = actor_type.into();
        self
    }

    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = details;
        self
    }

    /// Fix the draft's position and predecessor and seal it with its hash
    ///
    /// Timestamps are truncated to microseconds by the fixed rendering.
    pub fn link(
        self,
        entry_id: EntryId,
        previous_hash: impl Into<String>,
    ) -> Result<CustodyEntry, serde_json::Error> {
        let mut entry = CustodyEntry {
            entry_id: entry_id.to_string(),
            timestamp: timestamp_format::render(&self.timestamp.trunc_subsecs(6)),
            event_id: self.event_id,
            action: self.action.as_str().to_string(),
            actor: self.actor,
            actor_type: self.actor_type,
            location: self.location,
            details: self.details,
            previous_hash: previous_hash.into(),
            entry_hash: String::new(),
            hash_algorithm: HASH_ALGORITHM.to_string(),
        };
        entry.entry_hash = entry.compute_hash()?.to_hex();
        Ok(entry)
    }
}
