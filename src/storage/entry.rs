//! # Storage Entry
//!
//! `StorageEntry` is the unit Storage owns: a key, its current value (or
//! tombstone), and the version vector `(timestamp_ms, node_id, seq)` used
//! for LWW ordering and de-duplication.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};

/// Keys are capped at 256 UTF-8 bytes (spec §4.2).
pub const MAX_KEY_BYTES: usize = 256;
/// Values are capped at 256 KiB of UTF-8 bytes (spec §4.2).
pub const MAX_VALUE_BYTES: usize = 256 * 1024;

/// A single versioned record in the store.
///
/// Invariants (spec §3):
/// - `value.is_some()` iff `tombstone == false`.
/// - `(timestamp_ms, node_id)` is the pair LWW orders on.
/// - `seq` strictly increases per `node_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub key: String,
    pub value: Option<String>,
    pub timestamp_ms: u64,
    pub node_id: String,
    pub seq: u64,
    pub tombstone: bool,
}

impl StorageEntry {
    /// Build a live (non-tombstone) entry, validating size limits.
    pub fn new_value(
        key: String,
        value: String,
        timestamp_ms: u64,
        node_id: String,
        seq: u64,
    ) -> EngineResult<Self> {
        let entry = Self {
            key,
            value: Some(value),
            timestamp_ms,
            node_id,
            seq,
            tombstone: false,
        };
        entry.validate()?;
        Ok(entry)
    }

    /// Build a tombstone entry for `key`.
    pub fn new_tombstone(key: String, timestamp_ms: u64, node_id: String, seq: u64) -> EngineResult<Self> {
        let entry = Self {
            key,
            value: None,
            timestamp_ms,
            node_id,
            seq,
            tombstone: true,
        };
        entry.validate()?;
        Ok(entry)
    }

    /// Check size limits and the value/tombstone invariant.
    ///
    /// Does not check monotonicity of `seq` — that is the Sequencer's and
    /// Storage's joint responsibility at write time, not a property of the
    /// entry in isolation.
    pub fn validate(&self) -> EngineResult<()> {
        if self.key.as_bytes().len() > MAX_KEY_BYTES {
            return Err(EngineError::PayloadTooLarge(format!(
                "key {} bytes exceeds {} byte limit",
                self.key.as_bytes().len(),
                MAX_KEY_BYTES
            )));
        }
        if self.key.is_empty() {
            return Err(EngineError::InvalidRequest("key must not be empty".into()));
        }
        match (&self.value, self.tombstone) {
            (Some(_), true) | (None, false) => {
                return Err(EngineError::Internal(
                    "value presence disagrees with tombstone flag".into(),
                ))
            }
            _ => {}
        }
        if let Some(v) = &self.value {
            if v.as_bytes().len() > MAX_VALUE_BYTES {
                return Err(EngineError::PayloadTooLarge(format!(
                    "value {} bytes exceeds {} byte limit",
                    v.as_bytes().len(),
                    MAX_VALUE_BYTES
                )));
            }
        }
        Ok(())
    }

    /// The version vector used for replay de-duplication.
    pub fn version(&self) -> (String, u64) {
        (self.node_id.clone(), self.seq)
    }
}
