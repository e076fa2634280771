//! # CBOR Codec
//!
//! Deterministic binary encoding of [`ReplicationEvent`] (spec §4.1). Field
//! order is fixed by declaration order (`key, node_id, seq, timestamp_ms,
//! tombstone, value?`); `serde_cbor` serializes struct fields in that
//! order, so two encoders on different devices produce byte-identical
//! output for equal events, and `value` is omitted entirely for
//! tombstones rather than encoded as a CBOR null.

use crate::error::{EngineError, EngineResult};
use crate::storage::StorageEntry;
use serde::{Deserialize, Serialize};

/// Replication events larger than this are rejected by `encode` (spec §4.1,
/// §8: 300 KiB = 307 200 bytes).
pub const MAX_EVENT_BYTES: usize = 300 * 1024;

/// The wire form of a [`StorageEntry`]. Field order here *is* the wire
/// contract — do not reorder without a compatibility plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationEvent {
    pub key: String,
    pub node_id: String,
    pub seq: u64,
    pub timestamp_ms: u64,
    pub tombstone: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<String>,
}

impl From<&StorageEntry> for ReplicationEvent {
    fn from(entry: &StorageEntry) -> Self {
        Self {
            key: entry.key.clone(),
            node_id: entry.node_id.clone(),
            seq: entry.seq,
            timestamp_ms: entry.timestamp_ms,
            tombstone: entry.tombstone,
            value: entry.value.clone(),
        }
    }
}

impl From<ReplicationEvent> for StorageEntry {
    fn from(ev: ReplicationEvent) -> Self {
        StorageEntry {
            key: ev.key,
            value: ev.value,
            timestamp_ms: ev.timestamp_ms,
            node_id: ev.node_id,
            seq: ev.seq,
            tombstone: ev.tombstone,
        }
    }
}

/// Encode `event` to canonical CBOR bytes.
///
/// Fails with [`EngineError::PayloadTooLarge`] if the encoded size exceeds
/// [`MAX_EVENT_BYTES`].
pub fn encode(event: &ReplicationEvent) -> EngineResult<Vec<u8>> {
    let bytes = serde_cbor::to_vec(event)
        .map_err(|e| EngineError::MalformedPayload(format!("encoding replication event: {e}")))?;
    if bytes.len() > MAX_EVENT_BYTES {
        return Err(EngineError::PayloadTooLarge(format!(
            "encoded event is {} bytes, limit is {}",
            bytes.len(),
            MAX_EVENT_BYTES
        )));
    }
    Ok(bytes)
}

/// Decode a [`ReplicationEvent`] from CBOR bytes.
///
/// Fails with [`EngineError::MalformedPayload`] on truncation, unknown
/// required fields, or a type mismatch. Also rejects (as malformed) a
/// tombstone event carrying a `value` or a non-tombstone event missing
/// one, since that combination can never have been produced by `encode`.
pub fn decode(bytes: &[u8]) -> EngineResult<ReplicationEvent> {
    if bytes.len() > MAX_EVENT_BYTES {
        return Err(EngineError::PayloadTooLarge(format!(
            "payload is {} bytes, limit is {}",
            bytes.len(),
            MAX_EVENT_BYTES
        )));
    }
    let event: ReplicationEvent = serde_cbor::from_slice(bytes)
        .map_err(|e| EngineError::MalformedPayload(format!("decoding replication event: {e}")))?;

    match (&event.value, event.tombstone) {
        (Some(_), true) | (None, false) => {
            return Err(EngineError::MalformedPayload(
                "value presence disagrees with tombstone flag".into(),
            ))
        }
        _ => {}
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ReplicationEvent {
        ReplicationEvent {
            key: "k".into(),
            node_id: "n1".into(),
            seq: 7,
            timestamp_ms: 123_456,
            tombstone: false,
            value: Some("v".into()),
        }
    }

    #[test]
    fn round_trip() {
        let ev = sample();
        let bytes = encode(&ev).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(ev, decoded);
    }

    #[test]
    fn encode_is_byte_stable() {
        let ev = sample();
        let a = encode(&ev).unwrap();
        let b = encode(&ev).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tombstone_omits_value_field() {
        let mut ev = sample();
        ev.tombstone = true;
        ev.value = None;
        let bytes = encode(&ev).unwrap();
        // The CBOR map should have 5 entries, not 6 — value is absent, not
        // present-and-null.
        let value: serde_cbor::Value = serde_cbor::from_slice(&bytes).unwrap();
        if let serde_cbor::Value::Map(m) = value {
            assert_eq!(m.len(), 5);
        } else {
            panic!("expected a CBOR map");
        }
    }

    #[test]
    fn oversize_event_fails_encode() {
        let mut ev = sample();
        ev.value = Some("x".repeat(MAX_EVENT_BYTES + 1));
        let err = encode(&ev).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::PayloadTooLarge);
    }

    #[test]
    fn boundary_sizes_307200_accepted_307201_rejected() {
        // Build values so the encoded event lands exactly at the boundary.
        // We binary-search the value length since CBOR framing overhead is
        // small and fixed for a given key/node/seq/timestamp shape.
        let base = ReplicationEvent {
            key: "k".into(),
            node_id: "n1".into(),
            seq: 1,
            timestamp_ms: 1,
            tombstone: false,
            value: Some(String::new()),
        };
        let overhead = encode(&base).unwrap().len();
        let room = MAX_EVENT_BYTES - overhead;

        let mut at_limit = base.clone();
        at_limit.value = Some("x".repeat(room));
        assert_eq!(encode(&at_limit).unwrap().len(), MAX_EVENT_BYTES);

        let mut over_limit = base;
        over_limit.value = Some("x".repeat(room + 1));
        let err = encode(&over_limit).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::PayloadTooLarge);
    }

    #[test]
    fn truncated_bytes_fail_decode() {
        let ev = sample();
        let mut bytes = encode(&ev).unwrap();
        bytes.truncate(bytes.len() / 2);
        let err = decode(&bytes).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Internal);
    }

    #[test]
    fn inconsistent_tombstone_value_rejected() {
        let mut ev = sample();
        ev.tombstone = true; // value still Some("v") — invalid combination
        let bytes = serde_cbor::to_vec(&ev).unwrap();
        let err = decode(&bytes).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Internal);
    }

    #[test]
    fn storage_entry_conversion_round_trips() {
        let entry = StorageEntry::new_value("k".into(), "v".into(), 10, "n1".into(), 3).unwrap();
        let ev: ReplicationEvent = (&entry).into();
        let back: StorageEntry = ev.into();
        assert_eq!(entry, back);
    }
}
