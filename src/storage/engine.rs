//! # Storage Engine
//!
//! The single source of truth for key state (spec §4.2). `get`/`get_all`
//! take a shared lock; `put`/`delete` take the exclusive lock. Callers
//! apply LWW themselves before calling `put` — Storage performs
//! unconditional replacement, matching the teacher's `RwLockEngine` split
//! between "the lock discipline" and "the policy above it".

use crate::error::EngineResult;
use crate::storage::entry::StorageEntry;
use crate::storage::journal::{JournalLoadReport, StorageJournal};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

/// Tombstones are retained at least this long before `gc_tombstones` will
/// remove them (spec §3).
pub const TOMBSTONE_RETENTION_MS: u64 = 24 * 60 * 60 * 1000;

/// The storage engine contract used by the Command Processor, Applicator,
/// and anti-entropy reconciliation path.
pub trait StorageEngine: Send + Sync {
    /// Look up `key`. Returns `None` for both a missing key and a
    /// tombstoned one — callers that need to see tombstones use
    /// `get_any` or `get_all`.
    fn get(&self, key: &str) -> Option<StorageEntry>;

    /// Look up `key` regardless of tombstone state — used by the
    /// Applicator, which must LWW-compare against a tombstone to decide
    /// whether a remote write should resurrect the key.
    fn get_any(&self, key: &str) -> Option<StorageEntry>;

    /// Unconditionally replace the entry for `entry.key`. Callers must
    /// have already resolved LWW; Storage does not re-check ordering.
    fn put(&self, entry: StorageEntry) -> EngineResult<()>;

    /// Write a tombstone for `key` with the given version vector.
    fn delete(&self, key: &str, timestamp_ms: u64, node_id: String, seq: u64) -> EngineResult<()>;

    /// All entries, tombstones included — used by Merkle tree construction
    /// and anti-entropy reconciliation.
    fn get_all(&self) -> Vec<StorageEntry>;

    /// Remove tombstones older than [`TOMBSTONE_RETENTION_MS`], relative to
    /// `now_ms`. Returns the number removed.
    fn gc_tombstones(&self, now_ms: u64) -> usize;

    /// Number of live (non-tombstone) keys.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory storage behind a single `RwLock<HashMap>`, with an optional
/// append-only journal for crash recovery.
///
/// Readers (`get`, `get_all`, `len`) take the shared lock; writers (`put`,
/// `delete`, `gc_tombstones`) take the exclusive lock. No suspension point
/// (disk I/O, channel send) ever happens while either lock is held across
/// an `.await` — the journal append happens under the write lock but is
/// synchronous file I/O, matching spec §5's "no suspension points while
/// holding Storage's write lock" for the async collaborators that sit
/// above this engine.
pub struct InMemoryStorage {
    data: RwLock<HashMap<String, StorageEntry>>,
    journal: Option<RwLock<StorageJournal>>,
}

impl InMemoryStorage {
    /// Create a purely in-memory engine with no persistence.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            journal: None,
        }
    }

    /// Create an engine backed by a journal file at `path`, replaying any
    /// existing records before returning.
    pub fn open_with_journal(path: impl AsRef<Path>) -> EngineResult<(Self, JournalLoadReport)> {
        let mut data = HashMap::new();
        let report = StorageJournal::load(&path, |entry| {
            data.insert(entry.key.clone(), entry);
        })?;
        let journal = StorageJournal::open(&path)?;
        Ok((
            Self {
                data: RwLock::new(data),
                journal: Some(RwLock::new(journal)),
            },
            report,
        ))
    }

    fn journal_append(&self, entry: &StorageEntry) -> EngineResult<()> {
        if let Some(j) = &self.journal {
            j.write()
                .expect("storage journal lock poisoned")
                .append(entry)?;
        }
        Ok(())
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for InMemoryStorage {
    fn get(&self, key: &str) -> Option<StorageEntry> {
        let data = self.data.read().expect("storage lock poisoned");
        data.get(key).filter(|e| !e.tombstone).cloned()
    }

    fn get_any(&self, key: &str) -> Option<StorageEntry> {
        let data = self.data.read().expect("storage lock poisoned");
        data.get(key).cloned()
    }

    fn put(&self, entry: StorageEntry) -> EngineResult<()> {
        entry.validate()?;
        self.journal_append(&entry)?;
        let mut data = self.data.write().expect("storage lock poisoned");
        data.insert(entry.key.clone(), entry);
        Ok(())
    }

    fn delete(&self, key: &str, timestamp_ms: u64, node_id: String, seq: u64) -> EngineResult<()> {
        let entry = StorageEntry::new_tombstone(key.to_string(), timestamp_ms, node_id, seq)?;
        self.journal_append(&entry)?;
        let mut data = self.data.write().expect("storage lock poisoned");
        data.insert(key.to_string(), entry);
        Ok(())
    }

    fn get_all(&self) -> Vec<StorageEntry> {
        let data = self.data.read().expect("storage lock poisoned");
        data.values().cloned().collect()
    }

    fn gc_tombstones(&self, now_ms: u64) -> usize {
        let mut data = self.data.write().expect("storage lock poisoned");
        let before = data.len();
        data.retain(|_, entry| {
            !(entry.tombstone && now_ms.saturating_sub(entry.timestamp_ms) >= TOMBSTONE_RETENTION_MS)
        });
        before - data.len()
    }

    fn len(&self) -> usize {
        let data = self.data.read().expect("storage lock poisoned");
        data.values().filter(|e| !e.tombstone).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn get_returns_none_for_missing_and_tombstoned() {
        let s = InMemoryStorage::new();
        assert!(s.get("absent").is_none());

        s.delete("k", 10, "n1".into(), 1).unwrap();
        assert!(s.get("k").is_none());
    }

    #[test]
    fn get_any_sees_tombstones_that_get_hides() {
        let s = InMemoryStorage::new();
        s.delete("k", 10, "n1".into(), 1).unwrap();
        assert!(s.get("k").is_none());
        assert!(s.get_any("k").unwrap().tombstone);
    }

    #[test]
    fn put_replaces_unconditionally() {
        let s = InMemoryStorage::new();
        let e1 = StorageEntry::new_value("k".into(), "a".into(), 10, "n1".into(), 1).unwrap();
        let e2 = StorageEntry::new_value("k".into(), "b".into(), 5, "n1".into(), 2).unwrap();
        s.put(e1).unwrap();
        s.put(e2).unwrap();
        // No LWW check here: whatever was put last wins, even with an
        // earlier timestamp, because Storage trusts the caller.
        assert_eq!(s.get("k").unwrap().value, Some("b".into()));
    }

    #[test]
    fn get_all_includes_tombstones() {
        let s = InMemoryStorage::new();
        s.put(StorageEntry::new_value("k1".into(), "v".into(), 1, "n".into(), 1).unwrap())
            .unwrap();
        s.delete("k2", 2, "n".into(), 2).unwrap();

        let all = s.get_all();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|e| e.key == "k1" && !e.tombstone));
        assert!(all.iter().any(|e| e.key == "k2" && e.tombstone));
    }

    #[test]
    fn gc_removes_only_old_tombstones() {
        let s = InMemoryStorage::new();
        s.delete("old", 0, "n".into(), 1).unwrap();
        s.delete("new", 1_000_000, "n".into(), 2).unwrap();

        let now = TOMBSTONE_RETENTION_MS + 500_000;
        let removed = s.gc_tombstones(now);
        assert_eq!(removed, 1);
        assert!(s.get_all().iter().all(|e| e.key != "old"));
        assert!(s.get_all().iter().any(|e| e.key == "new"));
    }

    #[test]
    fn journal_recovers_state_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("storage.journal");

        {
            let (s, report) = InMemoryStorage::open_with_journal(&path).unwrap();
            assert_eq!(report.records_applied, 0);
            s.put(StorageEntry::new_value("k".into(), "v1".into(), 1, "n".into(), 1).unwrap())
                .unwrap();
            s.put(StorageEntry::new_value("k".into(), "v2".into(), 2, "n".into(), 2).unwrap())
                .unwrap();
        }

        let (s2, report) = InMemoryStorage::open_with_journal(&path).unwrap();
        assert_eq!(report.records_applied, 2);
        assert_eq!(s2.get("k").unwrap().value, Some("v2".into()));
    }

    #[test]
    fn len_excludes_tombstones() {
        let s = InMemoryStorage::new();
        s.put(StorageEntry::new_value("a".into(), "1".into(), 1, "n".into(), 1).unwrap())
            .unwrap();
        s.delete("b", 1, "n".into(), 2).unwrap();
        assert_eq!(s.len(), 1);
    }
}
