//! Decrypted evidence records
//!
//! Structural validation of a decrypted payload. Failures here mean the
//! edge device sent well-authenticated but unusable content, which is a
//! different situation from a blob that fails authentication.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Payload must be a JSON object")]
    NotAnObject,
    #[error("Payload is missing a non-empty event_id")]
    MissingEventId,
    #[error("Payload timestamp is not an ISO 8601 date-time")]
    InvalidTimestamp,
    #[error("Payload location is invalid: {0}")]
    InvalidLocation(&'static str),
}

/// A validated crash-evidence record
///
/// Always a JSON object with a non-empty string `event_id`. Everything else
/// (telemetry, calculated values, device metadata) is carried as-is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "Map<String, Value>", try_from = "Map<String, Value>")]
pub struct EvidenceRecord(Map<String, Value>);

impl EvidenceRecord {
    /// Parse and validate decrypted plaintext
    pub fn from_plaintext(plaintext: &[u8]) -> Result<Self, PayloadError> {
        Self::from_value(serde_json::from_slice(plaintext)?)
    }

    /// Validate and normalize a JSON value
    pub fn from_value(value: Value) -> Result<Self, PayloadError> {
        match value {
            Value::Object(map) => Self::try_from(map),
            _ => Err(PayloadError::NotAnObject),
        }
    }

    pub fn event_id(&self) -> &str {
        self.0
            .get("event_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Event time reported by the device, if any
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.0
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Number of raw telemetry samples shipped with the event
    pub fn telemetry_len(&self) -> usize {
        self.0
            .get("raw_data")
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl TryFrom<Map<String, Value>> for EvidenceRecord {
    type Error = PayloadError;

    fn try_from(mut map: Map<String, Value>) -> Result<Self, Self::Error> {
        match map.get("event_id").and_then(Value::as_str) {
            Some(id) if !id.trim().is_empty() => {}
            _ => return Err(PayloadError::MissingEventId),
        }

        if let Some(Value::String(raw)) = map.get("timestamp") {
            let normalized = normalize_timestamp(raw)?;
            map.insert("timestamp".into(), Value::String(normalized));
        }

        if let Some(location) = map.get("location") {
            if let Some(point) = to_geojson(location)? {
                map.insert("location".into(), point);
            }
        }

        Ok(Self(map))
    }
}

impl From<EvidenceRecord> for Map<String, Value> {
    fn from(record: EvidenceRecord) -> Self {
        record.0
    }
}

/// Render a device timestamp as RFC 3339 UTC; naive times are taken as UTC
fn normalize_timestamp(raw: &str) -> Result<String, PayloadError> {
    let parsed = match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => ts.with_timezone(&Utc),
        Err(_) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| Utc.from_utc_datetime(&naive))
            .map_err(|_| PayloadError::InvalidTimestamp)?,
    };
    Ok(parsed.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Rewrite `{latitude, longitude, address?}` as a GeoJSON point
///
/// Returns `None` when the location is already GeoJSON or carries no
/// coordinates, in which case it is kept untouched.
fn to_geojson(location: &Value) -> Result<Option<Value>, PayloadError> {
    let Some(obj) = location.as_object() else {
        return Err(PayloadError::InvalidLocation("not an object"));
    };
    let (Some(lat), Some(lon)) = (obj.get("latitude"), obj.get("longitude")) else {
        return Ok(None);
    };

    let lat = lat
        .as_f64()
        .filter(|v| (-90.0..=90.0).contains(v))
        .ok_or(PayloadError::InvalidLocation("latitude out of range"))?;
    let lon = lon
        .as_f64()
        .filter(|v| (-180.0..=180.0).contains(v))
        .ok_or(PayloadError::InvalidLocation("longitude out of range"))?;

    Ok(Some(json!({
        "type": "Point",
        "coordinates": [lon, lat],
        "address": obj.get("address").cloned().unwrap_or(Value::Null),
    })))
}
