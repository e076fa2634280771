//! # Anti-Entropy
//!
//! Periodic reconciliation against peers, as a backstop for whatever the
//! Publisher/Applicator real-time path misses (network partition,
//! restart, dropped MQTT message) — spec §4.9, §4.10. `protocol` holds
//! the level-walk comparison algorithm and wire message types; this
//! module drives it against a live [`StorageEngine`] and
//! [`MerkleTree`], applying anything the walk finds through the same
//! [`lww::select_winner`] path the real-time Applicator uses.

pub mod peer_client;
pub mod protocol;
pub mod rate_limiter;

pub use peer_client::{run_responder, TcpPeerClient};
pub use protocol::{find_divergent_keys, fetch_keys, PeerClient, SyncKeysRequest, SyncKeysResponse, SyncRequest, SyncResponse};
pub use rate_limiter::PerPeerRateLimiter;

use crate::error::{EngineError, EngineResult};
use crate::lww::{self, Winner};
use crate::merkle::MerkleTree;
use crate::storage::StorageEngine;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Default per-peer budget (spec §4.10): 5 reconciliation rounds per
/// second, with a burst of the same size.
pub const DEFAULT_RATE_LIMIT_PER_SEC: f64 = 5.0;

/// Runs one full reconciliation round against a single peer: walk the
/// tree, fetch divergent entries, and apply whichever side's LWW version
/// wins.
pub struct AntiEntropySession<S: StorageEngine> {
    storage: Arc<S>,
    skew_max_future_ms: u64,
    rate_limiter: PerPeerRateLimiter,
    /// Rounds that ran to completion (rate limit permitting), for
    /// `EngineStats`.
    rounds_completed: AtomicU64,
    /// Rounds skipped by the rate limiter before issuing any peer I/O.
    rounds_rate_limited: AtomicU64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub keys_compared_divergent: usize,
    pub keys_applied_from_peer: usize,
    pub keys_kept_local: usize,
}

impl<S: StorageEngine> AntiEntropySession<S> {
    pub fn new(storage: Arc<S>, skew_max_future_ms: u64) -> Self {
        Self::with_rate_limit(storage, skew_max_future_ms, DEFAULT_RATE_LIMIT_PER_SEC)
    }

    pub fn with_rate_limit(storage: Arc<S>, skew_max_future_ms: u64, rate_per_sec: f64) -> Self {
        Self {
            storage,
            skew_max_future_ms,
            rate_limiter: PerPeerRateLimiter::new(rate_per_sec, rate_per_sec),
            rounds_completed: AtomicU64::new(0),
            rounds_rate_limited: AtomicU64::new(0),
        }
    }

    /// Build a fresh tree snapshot of everything currently in Storage.
    pub fn build_tree(&self) -> MerkleTree {
        MerkleTree::rebuild_from(&self.storage.get_all())
    }

    /// Reconciliation rounds that ran to completion since this session
    /// was created.
    pub fn rounds_completed(&self) -> u64 {
        self.rounds_completed.load(AtomicOrdering::Relaxed)
    }

    /// Rounds skipped by the per-peer rate limiter before any peer I/O.
    pub fn rounds_rate_limited(&self) -> u64 {
        self.rounds_rate_limited.load(AtomicOrdering::Relaxed)
    }

    /// Reconcile against `peer`, applying any entries the peer has that
    /// should win LWW locally. Exceeding `peer_id`'s rate budget returns
    /// `RateLimited` without issuing a single request to the peer (spec
    /// §4.10).
    pub fn reconcile(&self, peer_id: &str, peer: &dyn PeerClient) -> EngineResult<ReconciliationReport> {
        if !self.rate_limiter.try_acquire(peer_id) {
            debug!("anti-entropy: rate limit exceeded for peer {peer_id}, skipping round");
            self.rounds_rate_limited.fetch_add(1, AtomicOrdering::Relaxed);
            return Err(EngineError::RateLimited);
        }
        self.rounds_completed.fetch_add(1, AtomicOrdering::Relaxed);

        let local_tree = self.build_tree();
        let mut report = ReconciliationReport::default();

        let divergent_keys = if local_tree.is_empty() {
            // Nothing locally to compare levels against; ask the peer for
            // its entire key set by requesting the full leaf level and
            // fetching everything it reports.
            let root = peer.request_level(SyncRequest { level: 0, parent_indices: vec![] })?;
            if root.hashes.is_empty() {
                Vec::new()
            } else {
                return Err(crate::error::EngineError::ProtocolError(
                    "empty local tree cannot resolve peer leaf indices to keys without an explicit key listing".into(),
                ));
            }
        } else {
            find_divergent_keys(&local_tree, peer)?
        };

        report.keys_compared_divergent = divergent_keys.len();
        if divergent_keys.is_empty() {
            debug!("anti-entropy: no divergence found");
            return Ok(report);
        }

        let entries = fetch_keys(peer, divergent_keys)?;
        let now_ms = lww::now_ms();
        for event in entries {
            let remote = event.into();
            let local = self.storage.get_any(&remote.key);
            let (winner, chosen) = lww::select_winner(local.as_ref(), &remote, now_ms, self.skew_max_future_ms);
            match winner {
                Winner::Remote => {
                    if let Err(e) = self.storage.put(chosen) {
                        warn!("anti-entropy: failed to apply peer entry: {e}");
                        continue;
                    }
                    report.keys_applied_from_peer += 1;
                }
                Winner::Local | Winner::EqualNoop | Winner::EqualAnomaly => {
                    report.keys_kept_local += 1;
                }
            }
        }

        info!(
            "anti-entropy reconciliation: {} divergent, {} applied from peer, {} kept local",
            report.keys_compared_divergent, report.keys_applied_from_peer, report.keys_kept_local
        );
        Ok(report)
    }
}
