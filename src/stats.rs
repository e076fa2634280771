//! # Engine Statistics
//!
//! Generalizes the teacher's `ServerStats` (atomics plus an `Instant`
//! uptime, exposed for whatever ambient logging/metrics surface consumes
//! it) from per-command counters to the whole replication/consistency
//! engine: Applicator outcomes (spec §4.7), Outbox overflow and liveness
//! (spec §4.5), Sequencer allocations (spec §4.4), and anti-entropy round
//! counts (spec §4.10). Not a metrics system in itself — just the
//! counters the rest of the engine already tracks, pulled into one
//! snapshot.

use crate::anti_entropy::AntiEntropySession;
use crate::applicator::{Applicator, ApplicatorStatsSnapshot};
use crate::outbox::Outbox;
use crate::sequencer::Sequencer;
use crate::storage::StorageEngine;
use std::time::Instant;

/// Tracks process uptime; every other counter it reports lives on the
/// component that owns it and is read at snapshot time.
pub struct EngineStats {
    start_time: Instant,
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineStats {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Pull a consistent-enough snapshot across the engine's components.
    /// Each field is read independently (no cross-component lock), the
    /// same tradeoff the teacher's `ServerStats` makes for its own
    /// per-counter atomics.
    pub fn snapshot<S: StorageEngine>(
        &self,
        applicator: &Applicator<S>,
        outbox: &Outbox,
        sequencer: &Sequencer,
        anti_entropy: &AntiEntropySession<S>,
    ) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            uptime_seconds: self.uptime_seconds(),
            applicator: applicator.stats.snapshot(),
            outbox_len: outbox.len(),
            outbox_dropped_for_overflow: outbox.dropped_for_overflow(),
            outbox_online: outbox.is_online(),
            outbox_last_flush_at_ms: outbox.last_flush_at_ms(),
            sequencer_allocations: sequencer.allocations(),
            anti_entropy_rounds_completed: anti_entropy.rounds_completed(),
            anti_entropy_rounds_rate_limited: anti_entropy.rounds_rate_limited(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    pub uptime_seconds: u64,
    pub applicator: ApplicatorStatsSnapshot,
    pub outbox_len: usize,
    pub outbox_dropped_for_overflow: u64,
    pub outbox_online: bool,
    pub outbox_last_flush_at_ms: Option<u64>,
    pub sequencer_allocations: u64,
    pub anti_entropy_rounds_completed: u64,
    pub anti_entropy_rounds_rate_limited: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anti_entropy::protocol::{PeerClient, SyncKeysRequest, SyncKeysResponse, SyncRequest, SyncResponse};
    use crate::error::EngineResult;
    use crate::lww;
    use crate::merkle::MerkleTree;
    use crate::outbox::OverflowPolicy;
    use crate::storage::{InMemoryStorage, StorageEntry};
    use std::sync::Arc;

    struct NoopPeer;
    impl PeerClient for NoopPeer {
        fn request_level(&self, request: SyncRequest) -> EngineResult<SyncResponse> {
            Ok(SyncResponse { peer_height: 0, level: request.level, hashes: vec![] })
        }
        fn request_keys(&self, _request: SyncKeysRequest) -> EngineResult<SyncKeysResponse> {
            Ok(SyncKeysResponse { entries: vec![] })
        }
    }

    #[test]
    fn snapshot_reflects_each_components_current_counters() {
        let storage = Arc::new(InMemoryStorage::new());
        let applicator = Applicator::new(storage.clone(), "n1".into(), lww::DEFAULT_SKEW_MAX_FUTURE_MS);
        let outbox = Outbox::new(10, OverflowPolicy::DropOldest);
        outbox.enqueue((&StorageEntry::new_value("a".into(), "1".into(), 1, "n1".into(), 1).unwrap()).into())
            .unwrap();
        let sequencer = Sequencer::new("n1", 1);
        sequencer.allocate().unwrap();
        sequencer.allocate().unwrap();
        let anti_entropy = AntiEntropySession::new(storage.clone(), lww::DEFAULT_SKEW_MAX_FUTURE_MS);
        anti_entropy.reconcile("peer", &NoopPeer).unwrap();

        let stats = EngineStats::new();
        let snapshot = stats.snapshot(&applicator, &outbox, &sequencer, &anti_entropy);

        assert_eq!(snapshot.outbox_len, 1);
        assert_eq!(snapshot.sequencer_allocations, 2);
        assert_eq!(snapshot.anti_entropy_rounds_completed, 1);
        assert_eq!(snapshot.applicator.events_applied, 0);
        let _ = MerkleTree::rebuild_from(&storage.get_all());
    }
}
