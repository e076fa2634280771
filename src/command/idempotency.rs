//! # Idempotency Cache
//!
//! Caches a [`CommandResponse`] per `request_id` for a bounded TTL, so a
//! retried request (client timeout, transport retry) replays the original
//! outcome instead of re-executing a mutation twice (spec §4.8). Bounded
//! by an LRU eviction policy on top of the TTL so a burst of unique
//! request IDs can't grow the cache without limit even if entries haven't
//! expired yet — the same "no crate has exactly this, hand-roll it over a
//! `HashMap`" shape as the Outbox's overflow handling.

use crate::command::envelope::CommandResponse;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    response: CommandResponse,
    inserted_at: Instant,
}

struct Inner {
    entries: HashMap<String, Entry>,
    /// Insertion order, used for LRU-by-insertion eviction once `capacity`
    /// is exceeded. A request_id already present is not reordered — a
    /// repeated request_id just extends the existing entry's relevance,
    /// it doesn't need to jump the queue.
    order: VecDeque<String>,
    capacity: usize,
    ttl: Duration,
}

/// TTL- and capacity-bounded cache of recent command responses, keyed by
/// client-supplied `request_id`.
pub struct IdempotencyCache {
    inner: Mutex<Inner>,
}

impl IdempotencyCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                capacity,
                ttl,
            }),
        }
    }

    /// Return the cached response for `request_id` if present and not
    /// expired.
    pub fn get(&self, request_id: &str) -> Option<CommandResponse> {
        let mut guard = self.inner.lock().expect("idempotency cache lock poisoned");
        let ttl = guard.ttl;
        let expired = guard
            .entries
            .get(request_id)
            .map(|e| e.inserted_at.elapsed() >= ttl)
            .unwrap_or(false);
        if expired {
            guard.entries.remove(request_id);
        }
        guard.entries.get(request_id).map(|e| e.response.clone())
    }

    /// Store `response` for `request_id`, evicting the oldest entry first
    /// if the cache is at capacity.
    pub fn insert(&self, request_id: String, response: CommandResponse) {
        let mut guard = self.inner.lock().expect("idempotency cache lock poisoned");
        if !guard.entries.contains_key(&request_id) {
            guard.order.push_back(request_id.clone());
        }
        guard.entries.insert(
            request_id,
            Entry {
                response,
                inserted_at: Instant::now(),
            },
        );
        while guard.entries.len() > guard.capacity {
            if let Some(oldest) = guard.order.pop_front() {
                guard.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("idempotency cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::envelope::CommandOutcome;

    fn response(id: &str) -> CommandResponse {
        CommandResponse {
            request_id: id.to_string(),
            outcome: CommandOutcome::Ok,
        }
    }

    #[test]
    fn stores_and_retrieves_by_request_id() {
        let cache = IdempotencyCache::new(10, Duration::from_secs(60));
        cache.insert("r1".into(), response("r1"));
        assert!(cache.get("r1").is_some());
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn expires_entries_past_ttl() {
        let cache = IdempotencyCache::new(10, Duration::from_millis(1));
        cache.insert("r1".into(), response("r1"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("r1").is_none());
    }

    #[test]
    fn evicts_oldest_entry_once_over_capacity() {
        let cache = IdempotencyCache::new(2, Duration::from_secs(60));
        cache.insert("r1".into(), response("r1"));
        cache.insert("r2".into(), response("r2"));
        cache.insert("r3".into(), response("r3"));

        assert!(cache.get("r1").is_none());
        assert!(cache.get("r2").is_some());
        assert!(cache.get("r3").is_some());
        assert_eq!(cache.len(), 2);
    }
}
