//! # Outbox
//!
//! Bounded, persistent, FIFO queue of not-yet-acknowledged outbound
//! [`ReplicationEvent`]s (spec §4.5). The Publisher enqueues here whenever
//! the transport is unavailable or backpressured, and drains it in order
//! once the transport recovers, giving at-least-once delivery without
//! requiring the transport itself to buffer anything.

use crate::codec::ReplicationEvent;
use crate::error::{EngineError, EngineResult};
use crate::lww;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// What happens when `enqueue` is called on a full outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the oldest queued event to make room (default, spec §9 open
    /// question resolved in favor of bounded memory over completeness —
    /// see DESIGN.md).
    DropOldest,
    /// Reject the new event, leaving the queue untouched.
    RejectNewest,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::DropOldest
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OutboxRecord {
    event: ReplicationEvent,
}

struct Inner {
    queue: VecDeque<ReplicationEvent>,
    capacity: usize,
    policy: OverflowPolicy,
    path: Option<PathBuf>,
    dropped_for_overflow: u64,
}

/// A bounded FIFO of outbound replication events, optionally persisted to
/// a flat file so pending events survive a restart.
pub struct Outbox {
    inner: Mutex<Inner>,
    /// Whether the Publisher last found the transport reachable. Starts
    /// `true`; the Publisher flips it on a `TransportUnavailable` error
    /// and back once a publish succeeds again.
    online: AtomicBool,
    /// `lww::now_ms()` timestamp of the last successful drain/publish, or
    /// 0 if none has happened yet this process.
    last_flush_at_ms: AtomicU64,
}

impl Outbox {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                capacity,
                policy,
                path: None,
                dropped_for_overflow: 0,
            }),
            online: AtomicBool::new(true),
            last_flush_at_ms: AtomicU64::new(0),
        }
    }

    /// Open an outbox persisted at `path`, restoring any events left over
    /// from a previous run in their original order.
    pub fn open(
        path: impl AsRef<Path>,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let queue = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => VecDeque::new(),
            Ok(bytes) => {
                let records: Vec<OutboxRecord> = bincode::deserialize(&bytes)
                    .map_err(|e| EngineError::StorageCorruption(format!("outbox file: {e}")))?;
                records.into_iter().map(|r| r.event).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(e) => return Err(EngineError::StorageIo(format!("reading outbox file: {e}"))),
        };

        let outbox = Self {
            inner: Mutex::new(Inner {
                queue,
                capacity,
                policy,
                path: Some(path),
                dropped_for_overflow: 0,
            }),
            online: AtomicBool::new(true),
            last_flush_at_ms: AtomicU64::new(0),
        };
        outbox.persist()?;
        Ok(outbox)
    }

    fn persist(&self) -> EngineResult<()> {
        let guard = self.inner.lock().expect("outbox lock poisoned");
        let Some(path) = &guard.path else { return Ok(()) };
        let records: Vec<OutboxRecord> = guard
            .queue
            .iter()
            .cloned()
            .map(|event| OutboxRecord { event })
            .collect();
        let bytes = bincode::serialize(&records)
            .map_err(|e| EngineError::StorageIo(format!("encoding outbox file: {e}")))?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, &bytes)
            .map_err(|e| EngineError::StorageIo(format!("writing outbox file: {e}")))?;
        fs::rename(&tmp_path, path)
            .map_err(|e| EngineError::StorageIo(format!("renaming outbox file: {e}")))?;
        Ok(())
    }

    /// Enqueue `event`, applying the configured overflow policy if the
    /// outbox is already at capacity. Returns `true` if the event was
    /// accepted.
    pub fn enqueue(&self, event: ReplicationEvent) -> EngineResult<bool> {
        let accepted = {
            let mut guard = self.inner.lock().expect("outbox lock poisoned");
            if guard.queue.len() >= guard.capacity {
                match guard.policy {
                    OverflowPolicy::DropOldest => {
                        guard.queue.pop_front();
                        guard.dropped_for_overflow += 1;
                        guard.queue.push_back(event);
                        true
                    }
                    OverflowPolicy::RejectNewest => false,
                }
            } else {
                guard.queue.push_back(event);
                true
            }
        };
        self.persist()?;
        Ok(accepted)
    }

    /// Remove and return up to `max` events from the front, oldest first,
    /// without persisting the removal — callers must call
    /// [`Outbox::acknowledge`] once the batch is durably published.
    pub fn peek_batch(&self, max: usize) -> Vec<ReplicationEvent> {
        let guard = self.inner.lock().expect("outbox lock poisoned");
        guard.queue.iter().take(max).cloned().collect()
    }

    /// Drop the first `count` events (the ones handed out by the most
    /// recent `peek_batch`) now that they've been published successfully.
    pub fn acknowledge(&self, count: usize) -> EngineResult<()> {
        {
            let mut guard = self.inner.lock().expect("outbox lock poisoned");
            for _ in 0..count.min(guard.queue.len()) {
                guard.queue.pop_front();
            }
        }
        self.persist()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("outbox lock poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_for_overflow(&self) -> u64 {
        self.inner.lock().expect("outbox lock poisoned").dropped_for_overflow
    }

    /// Whether the transport was reachable as of the most recent publish
    /// attempt.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// Record that the transport just rejected a publish as unavailable.
    pub fn mark_offline(&self) {
        self.online.store(false, Ordering::Relaxed);
    }

    /// Record that the transport just accepted a publish, and that this
    /// moment counts as a flush.
    pub fn mark_online_and_flushed(&self) {
        self.online.store(true, Ordering::Relaxed);
        self.last_flush_at_ms.store(lww::now_ms(), Ordering::Relaxed);
    }

    /// `lww::now_ms()` timestamp of the last successful publish or drain,
    /// or `None` if nothing has flushed yet this process.
    pub fn last_flush_at_ms(&self) -> Option<u64> {
        match self.last_flush_at_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }
}
