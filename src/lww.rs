//! # Last-Write-Wins Resolver
//!
//! Total order over `(timestamp_ms, node_id)` (spec §4.3). Foreign
//! timestamps that run too far ahead of the local clock are clamped before
//! comparison, bounding the damage a single node with a broken clock can
//! do to the rest of the cluster.

use crate::storage::StorageEntry;
use log::warn;
use std::time::{SystemTime, UNIX_EPOCH};

/// How far into the future an incoming timestamp may claim to be before
/// it's clamped back to the local boundary (spec §4.3 default: 5 minutes).
pub const DEFAULT_SKEW_MAX_FUTURE_MS: u64 = 5 * 60 * 1000;

/// Outcome of comparing two versions of the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
    /// Same `(timestamp_ms, node_id)` but the content actually differs —
    /// an anomaly (two different payloads claiming the same version
    /// vector), not a normal conflict. The caller keeps local and should
    /// bump an anomaly counter.
    EqualAnomaly,
    /// Same `(timestamp_ms, node_id)` and identical content: a re-delivery.
    EqualNoop,
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Clamp `timestamp_ms` so it never exceeds `local_now_ms + skew_max_future_ms`.
pub fn clamp_future_skew(timestamp_ms: u64, local_now_ms: u64, skew_max_future_ms: u64) -> u64 {
    let ceiling = local_now_ms.saturating_add(skew_max_future_ms);
    if timestamp_ms > ceiling {
        warn!(
            "clamping future-skewed timestamp {} down to {} (local_now={}, max_future={})",
            timestamp_ms, ceiling, local_now_ms, skew_max_future_ms
        );
        ceiling
    } else {
        timestamp_ms
    }
}

/// Total order comparator: `a > b` iff `a.timestamp_ms > b.timestamp_ms`,
/// or equal timestamps with `a.node_id > b.node_id` lexicographically.
fn version_greater(a: (u64, &str), b: (u64, &str)) -> bool {
    match a.0.cmp(&b.0) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => a.1 > b.1,
    }
}

/// Decide which of `local` and `remote` should be stored, after clamping
/// `remote`'s timestamp against `local_now_ms`.
///
/// `local` is `None` when the key has no local entry yet, in which case
/// remote always wins.
pub fn select_winner(
    local: Option<&StorageEntry>,
    remote: &StorageEntry,
    local_now_ms: u64,
    skew_max_future_ms: u64,
) -> (Winner, StorageEntry) {
    let mut remote = remote.clone();
    remote.timestamp_ms = clamp_future_skew(remote.timestamp_ms, local_now_ms, skew_max_future_ms);

    let Some(local) = local else {
        return (Winner::Remote, remote);
    };

    let local_key = (local.timestamp_ms, local.node_id.as_str());
    let remote_key = (remote.timestamp_ms, remote.node_id.as_str());

    if version_greater(remote_key, local_key) {
        (Winner::Remote, remote)
    } else if version_greater(local_key, remote_key) {
        (Winner::Local, local.clone())
    } else if local == &remote {
        (Winner::EqualNoop, local.clone())
    } else {
        (Winner::EqualAnomaly, local.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: &str, ts: u64, node: &str, seq: u64) -> StorageEntry {
        StorageEntry::new_value(key.into(), value.into(), ts, node.into(), seq).unwrap()
    }

    #[test]
    fn higher_timestamp_wins() {
        let local = entry("k", "old", 1000, "n1", 1);
        let remote = entry("k", "new", 2000, "n2", 1);
        let (winner, chosen) = select_winner(Some(&local), &remote, 10_000, DEFAULT_SKEW_MAX_FUTURE_MS);
        assert_eq!(winner, Winner::Remote);
        assert_eq!(chosen.value, Some("new".into()));
    }

    #[test]
    fn tie_break_by_node_id_lexicographic() {
        // Scenario 1 from spec §8: n1 SETs "x" at ts=1000, n2 SETs "y" at
        // ts=1000. Because "n2" > "n1", the remote (from n2) wins.
        let local = entry("k", "x", 1000, "n1", 1);
        let remote = entry("k", "y", 1000, "n2", 1);
        let (winner, chosen) = select_winner(Some(&local), &remote, 10_000, DEFAULT_SKEW_MAX_FUTURE_MS);
        assert_eq!(winner, Winner::Remote);
        assert_eq!(chosen.value, Some("y".into()));
    }

    #[test]
    fn lower_node_id_loses_tie() {
        let local = entry("k", "y", 1000, "n2", 1);
        let remote = entry("k", "x", 1000, "n1", 1);
        let (winner, chosen) = select_winner(Some(&local), &remote, 10_000, DEFAULT_SKEW_MAX_FUTURE_MS);
        assert_eq!(winner, Winner::Local);
        assert_eq!(chosen.value, Some("y".into()));
    }

    #[test]
    fn future_skew_is_clamped_before_comparison() {
        // Scenario 2 from spec §8: remote event at local_now + 10min is
        // clamped to local_now + 5min.
        let local_now = 1_000_000u64;
        let remote_ts = local_now + 10 * 60 * 1000;
        let clamped = clamp_future_skew(remote_ts, local_now, DEFAULT_SKEW_MAX_FUTURE_MS);
        assert_eq!(clamped, local_now + DEFAULT_SKEW_MAX_FUTURE_MS);
    }

    #[test]
    fn equal_version_identical_content_is_noop() {
        let local = entry("k", "v", 1000, "n1", 1);
        let remote = local.clone();
        let (winner, _) = select_winner(Some(&local), &remote, 10_000, DEFAULT_SKEW_MAX_FUTURE_MS);
        assert_eq!(winner, Winner::EqualNoop);
    }

    #[test]
    fn equal_version_differing_content_is_anomaly_and_keeps_local() {
        let local = entry("k", "a", 1000, "n1", 1);
        let mut remote = local.clone();
        remote.value = Some("b".into());
        let (winner, chosen) = select_winner(Some(&local), &remote, 10_000, DEFAULT_SKEW_MAX_FUTURE_MS);
        assert_eq!(winner, Winner::EqualAnomaly);
        assert_eq!(chosen.value, Some("a".into()));
    }

    #[test]
    fn no_local_entry_remote_always_wins() {
        let remote = entry("k", "v", 1, "n1", 1);
        let (winner, chosen) = select_winner(None, &remote, 10_000, DEFAULT_SKEW_MAX_FUTURE_MS);
        assert_eq!(winner, Winner::Remote);
        assert_eq!(chosen.value, Some("v".into()));
    }
}
