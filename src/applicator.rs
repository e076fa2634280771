//! # Event Applicator
//!
//! Consumes incoming replication payloads, decodes them, resolves LWW
//! against whatever Storage currently holds for that key, and applies the
//! winner (spec §4.7). Loop prevention drops a node's own echoes outright;
//! dedup then tracks, per source node, exactly which `seq` values have
//! already been applied (spec §4.7 step 5), so an out-of-order delivery
//! that arrives ahead of an earlier `seq` is never mistaken for a
//! duplicate of something that was never actually seen.

use crate::codec;
use crate::lww::{self, Winner};
use crate::storage::StorageEngine;
use log::{debug, warn};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Largest number of out-of-order (not yet contiguous with `base`) seqs a
/// single source's window keeps track of. A source that reorders deliveries
/// more than this apart degrades to evicting its oldest entry rather than
/// growing unboundedly — a pathological case, not the common one.
const MAX_OUT_OF_ORDER_WINDOW: usize = 4096;

/// Dedup state for a single source node: `base` is the highest seq known to
/// be part of an unbroken applied prefix; `seen` holds seqs above `base`
/// that have been applied but have a gap below them still unfilled.
#[derive(Default)]
struct SourceWindow {
    base: u64,
    seen: BTreeSet<u64>,
}

impl SourceWindow {
    /// Returns true if `seq` was already applied (stale/duplicate) and
    /// records it as seen otherwise, folding `base` forward over any newly
    /// contiguous run.
    fn check_and_record(&mut self, seq: u64) -> bool {
        if seq <= self.base || self.seen.contains(&seq) {
            return true;
        }
        self.seen.insert(seq);
        if self.seen.len() > MAX_OUT_OF_ORDER_WINDOW {
            if let Some(&oldest) = self.seen.iter().next() {
                warn!("dedup window overflow, evicting seq {oldest} to bound memory");
                self.seen.remove(&oldest);
            }
        }
        while self.seen.remove(&(self.base + 1)) {
            self.base += 1;
        }
        false
    }
}

/// Monotonically-increasing counters for observability (spec §4.7,
/// generalizing the teacher's `ServerStats` pattern of plain
/// `AtomicU64` fields rather than a metrics crate).
#[derive(Default)]
pub struct ApplicatorStats {
    pub events_received: AtomicU64,
    pub events_applied: AtomicU64,
    pub events_loop_prevented: AtomicU64,
    pub events_stale_duplicate: AtomicU64,
    pub events_lww_rejected: AtomicU64,
    pub events_anomaly: AtomicU64,
    pub events_malformed: AtomicU64,
}

impl ApplicatorStats {
    pub fn snapshot(&self) -> ApplicatorStatsSnapshot {
        ApplicatorStatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_loop_prevented: self.events_loop_prevented.load(Ordering::Relaxed),
            events_stale_duplicate: self.events_stale_duplicate.load(Ordering::Relaxed),
            events_lww_rejected: self.events_lww_rejected.load(Ordering::Relaxed),
            events_anomaly: self.events_anomaly.load(Ordering::Relaxed),
            events_malformed: self.events_malformed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplicatorStatsSnapshot {
    pub events_received: u64,
    pub events_applied: u64,
    pub events_loop_prevented: u64,
    pub events_stale_duplicate: u64,
    pub events_lww_rejected: u64,
    pub events_anomaly: u64,
    pub events_malformed: u64,
}

/// Applies incoming replication events to a [`StorageEngine`].
pub struct Applicator<S: StorageEngine> {
    storage: Arc<S>,
    local_node_id: String,
    skew_max_future_ms: u64,
    /// Per-source dedup window (spec §4.7 step 5): bounded by the number
    /// of distinct peers plus each peer's `MAX_OUT_OF_ORDER_WINDOW`, not
    /// by event volume.
    seen_by_source: Mutex<HashMap<String, SourceWindow>>,
    pub stats: ApplicatorStats,
}

impl<S: StorageEngine> Applicator<S> {
    pub fn new(storage: Arc<S>, local_node_id: String, skew_max_future_ms: u64) -> Self {
        Self {
            storage,
            local_node_id,
            skew_max_future_ms,
            seen_by_source: Mutex::new(HashMap::new()),
            stats: ApplicatorStats::default(),
        }
    }

    /// Decode and apply a single incoming payload. Never returns an error
    /// for a decode/validation failure — those are logged and counted,
    /// since one peer's bad payload must not stop the applicator loop.
    pub fn apply_payload(&self, payload: &[u8]) {
        self.stats.events_received.fetch_add(1, Ordering::Relaxed);

        let event = match codec::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping malformed replication payload: {e}");
                self.stats.events_malformed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if event.node_id == self.local_node_id {
            debug!("loop prevention: dropping own event for {}", event.key);
            self.stats.events_loop_prevented.fetch_add(1, Ordering::Relaxed);
            return;
        }

        {
            let mut seen_by_source = self.seen_by_source.lock().expect("applicator lock poisoned");
            let window = seen_by_source.entry(event.node_id.clone()).or_default();
            if window.check_and_record(event.seq) {
                debug!("dropping stale/duplicate event {}/{}", event.node_id, event.seq);
                self.stats.events_stale_duplicate.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let remote = event.into();
        let local = self.storage.get_any(&remote.key);
        let now_ms = lww::now_ms();
        let (winner, chosen) = lww::select_winner(local.as_ref(), &remote, now_ms, self.skew_max_future_ms);

        match winner {
            Winner::Remote => {
                if let Err(e) = self.storage.put(chosen) {
                    warn!("failed to apply remote event for {}: {e}", remote.key);
                    return;
                }
                self.stats.events_applied.fetch_add(1, Ordering::Relaxed);
            }
            Winner::Local => {
                self.stats.events_lww_rejected.fetch_add(1, Ordering::Relaxed);
            }
            Winner::EqualNoop => {}
            Winner::EqualAnomaly => {
                warn!(
                    "LWW anomaly: key {} has differing content at identical version, keeping local",
                    remote.key
                );
                self.stats.events_anomaly.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Run the incoming-payload loop until `incoming` closes.
    pub async fn run(self: Arc<Self>, mut incoming: mpsc::Receiver<Vec<u8>>) {
        while let Some(payload) = incoming.recv().await {
            self.apply_payload(&payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ReplicationEvent;
    use crate::storage::{InMemoryStorage, StorageEntry};

    fn event(key: &str, node_id: &str, seq: u64, ts: u64, value: &str) -> Vec<u8> {
        let ev = ReplicationEvent {
            key: key.into(),
            node_id: node_id.into(),
            seq,
            timestamp_ms: ts,
            tombstone: false,
            value: Some(value.into()),
        };
        codec::encode(&ev).unwrap()
    }

    #[test]
    fn applies_remote_event_when_no_local_entry() {
        let storage = Arc::new(InMemoryStorage::new());
        let applicator = Applicator::new(storage.clone(), "local".into(), lww::DEFAULT_SKEW_MAX_FUTURE_MS);

        applicator.apply_payload(&event("k", "remote", 1, 100, "v1"));

        assert_eq!(storage.get("k").unwrap().value, Some("v1".into()));
        assert_eq!(applicator.stats.snapshot().events_applied, 1);
    }

    #[test]
    fn drops_own_events_for_loop_prevention() {
        let storage = Arc::new(InMemoryStorage::new());
        let applicator = Applicator::new(storage.clone(), "local".into(), lww::DEFAULT_SKEW_MAX_FUTURE_MS);

        applicator.apply_payload(&event("k", "local", 1, 100, "v1"));

        assert!(storage.get("k").is_none());
        assert_eq!(applicator.stats.snapshot().events_loop_prevented, 1);
    }

    #[test]
    fn drops_stale_duplicate_by_seq_high_water() {
        let storage = Arc::new(InMemoryStorage::new());
        let applicator = Applicator::new(storage.clone(), "local".into(), lww::DEFAULT_SKEW_MAX_FUTURE_MS);

        applicator.apply_payload(&event("k", "remote", 5, 100, "v1"));
        applicator.apply_payload(&event("k", "remote", 3, 50, "v0"));

        assert_eq!(storage.get("k").unwrap().value, Some("v1".into()));
        assert_eq!(applicator.stats.snapshot().events_stale_duplicate, 1);
    }

    #[test]
    fn out_of_order_delivery_does_not_drop_an_unseen_earlier_seq() {
        let storage = Arc::new(InMemoryStorage::new());
        let applicator = Applicator::new(storage.clone(), "local".into(), lww::DEFAULT_SKEW_MAX_FUTURE_MS);

        // seq 5 arrives before seq 3 for the same source; seq 3 was never
        // actually applied yet and must not be treated as stale.
        applicator.apply_payload(&event("k1", "remote", 5, 100, "v5"));
        applicator.apply_payload(&event("k2", "remote", 3, 90, "v3"));

        assert_eq!(storage.get("k1").unwrap().value, Some("v5".into()));
        assert_eq!(storage.get("k2").unwrap().value, Some("v3".into()));
        assert_eq!(applicator.stats.snapshot().events_stale_duplicate, 0);

        // A genuine repeat of seq 3 is now a real duplicate.
        applicator.apply_payload(&event("k2", "remote", 3, 90, "v3"));
        assert_eq!(applicator.stats.snapshot().events_stale_duplicate, 1);
    }

    #[test]
    fn lww_loser_is_rejected_without_mutating_storage() {
        let storage = Arc::new(InMemoryStorage::new());
        storage
            .put(StorageEntry::new_value("k".into(), "local-v".into(), 2000, "z".into(), 1).unwrap())
            .unwrap();
        let applicator = Applicator::new(storage.clone(), "local".into(), lww::DEFAULT_SKEW_MAX_FUTURE_MS);

        applicator.apply_payload(&event("k", "remote", 1, 1000, "older"));

        assert_eq!(storage.get("k").unwrap().value, Some("local-v".into()));
        assert_eq!(applicator.stats.snapshot().events_lww_rejected, 1);
    }

    #[test]
    fn malformed_payload_is_counted_and_does_not_panic() {
        let storage = Arc::new(InMemoryStorage::new());
        let applicator = Applicator::new(storage, "local".into(), lww::DEFAULT_SKEW_MAX_FUTURE_MS);

        applicator.apply_payload(b"not cbor");

        assert_eq!(applicator.stats.snapshot().events_malformed, 1);
    }

    #[test]
    fn remote_write_can_resurrect_a_tombstoned_key() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.delete("k", 100, "local".into(), 1).unwrap();
        let applicator = Applicator::new(storage.clone(), "local".into(), lww::DEFAULT_SKEW_MAX_FUTURE_MS);

        applicator.apply_payload(&event("k", "remote", 1, 200, "resurrected"));

        assert_eq!(storage.get("k").unwrap().value, Some("resurrected".into()));
    }
}
