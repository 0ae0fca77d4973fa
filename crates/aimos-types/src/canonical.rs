//! Canonical serialization, hashing, and timestamp formatting helpers.
//!
//! Everything that feeds a content hash or a persisted ordering key goes
//! through here so that identical inputs produce identical bytes.

use crate::error::{AimosError, AimosResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serialize `value` as compact JSON with object keys sorted.
///
/// Going through `serde_json::Value` first sorts map keys, because the
/// default `Value` object is backed by a `BTreeMap`.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> AimosResult<String> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&value)?)
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    hex::encode(hasher.finalize())
}

/// Fixed-width RFC 3339 timestamp (microseconds, `Z` suffix).
///
/// The fixed width keeps lexicographic order equal to chronological order,
/// which the relational backend relies on for range predicates.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp written by [`format_ts`] (any RFC 3339 form is accepted).
pub fn parse_ts(raw: &str) -> AimosResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AimosError::Serialization(format!("invalid timestamp '{raw}': {e}")))
}
