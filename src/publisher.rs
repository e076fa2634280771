//! # Event Publisher
//!
//! Consumes local mutations from a bounded channel, encodes each one and
//! hands it to the [`Transport`], falling back to the [`Outbox`] whenever
//! the transport reports backpressure (spec §4.6). A periodic drain pass
//! retries whatever the Outbox is still holding, oldest first, so a
//! reconnect eventually catches the transport back up without the
//! Publisher's main loop ever blocking on it.

use crate::codec::{self, ReplicationEvent};
use crate::error::EngineError;
use crate::outbox::Outbox;
use crate::storage::StorageEntry;
use crate::transport::Transport;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How many outbox events a single drain pass attempts to flush.
const DRAIN_BATCH_SIZE: usize = 64;

/// Topic a replication event for `node_id`/`topic_prefix` is published on.
/// Matches the teacher's `{topic_prefix}/events` convention.
pub fn events_topic(topic_prefix: &str) -> String {
    format!("{topic_prefix}/events")
}

/// Runs the Publisher's main loop: receive local mutations, encode and
/// publish-or-enqueue, and periodically drain the outbox.
pub struct Publisher<T: Transport> {
    transport: Arc<T>,
    outbox: Arc<Outbox>,
    topic_prefix: String,
    drain_interval: Duration,
}

impl<T: Transport + 'static> Publisher<T> {
    pub fn new(transport: Arc<T>, outbox: Arc<Outbox>, topic_prefix: String, drain_interval: Duration) -> Self {
        Self {
            transport,
            outbox,
            topic_prefix,
            drain_interval,
        }
    }

    /// Publish `entry` now if the transport has room, otherwise enqueue it
    /// in the Outbox for the next drain pass. Never blocks.
    pub fn publish_or_enqueue(&self, entry: &StorageEntry) {
        let event: ReplicationEvent = entry.into();
        let topic = events_topic(&self.topic_prefix);

        match codec::encode(&event) {
            Ok(bytes) => match self.transport.try_publish(&topic, bytes) {
                Ok(()) => {
                    self.outbox.mark_online_and_flushed();
                    debug!("published {} (seq={})", event.key, event.seq);
                }
                Err(EngineError::TransportUnavailable(reason)) => {
                    self.outbox.mark_offline();
                    debug!("transport unavailable ({reason}), enqueueing {} in outbox", event.key);
                    self.enqueue(event);
                }
                Err(e) => warn!("unexpected transport error publishing {}: {e}", event.key),
            },
            Err(e) => {
                // A too-large or malformed event can never succeed later
                // either; log and drop rather than poison the outbox.
                warn!("dropping unpublishable event for {}: {e}", event.key);
            }
        }
    }

    fn enqueue(&self, event: ReplicationEvent) {
        match self.outbox.enqueue(event) {
            Ok(true) => {}
            Ok(false) => warn!("outbox full, rejected event"),
            Err(e) => warn!("failed to persist outbox enqueue: {e}"),
        }
    }

    /// Attempt to publish the oldest batch currently in the outbox.
    /// Publishing stops at the first event the transport refuses, so
    /// ordering is preserved: a batch is never partially reordered.
    pub fn drain_outbox_once(&self) {
        let batch = self.outbox.peek_batch(DRAIN_BATCH_SIZE);
        if batch.is_empty() {
            return;
        }
        let topic = events_topic(&self.topic_prefix);
        let mut acknowledged = 0usize;
        for event in &batch {
            let bytes = match codec::encode(event) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("dropping unpublishable outbox event for {}: {e}", event.key);
                    acknowledged += 1;
                    continue;
                }
            };
            match self.transport.try_publish(&topic, bytes) {
                Ok(()) => {
                    self.outbox.mark_online_and_flushed();
                    acknowledged += 1;
                }
                Err(_) => {
                    self.outbox.mark_offline();
                    break;
                }
            }
        }
        if acknowledged > 0 {
            if let Err(e) = self.outbox.acknowledge(acknowledged) {
                warn!("failed to persist outbox acknowledge: {e}");
            }
        }
    }

    /// Run the mutation-consuming loop plus a periodic outbox drain until
    /// `mutations` closes.
    pub async fn run(self: Arc<Self>, mut mutations: mpsc::Receiver<StorageEntry>) {
        let mut drain_timer = tokio::time::interval(self.drain_interval);
        loop {
            tokio::select! {
                maybe_entry = mutations.recv() => {
                    match maybe_entry {
                        Some(entry) => self.publish_or_enqueue(&entry),
                        None => break,
                    }
                }
                _ = drain_timer.tick() => {
                    self.drain_outbox_once();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::OverflowPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeTransport {
        accept: bool,
        published: Mutex<Vec<(String, Vec<u8>)>>,
        call_count: AtomicUsize,
    }

    impl FakeTransport {
        fn new(accept: bool) -> Self {
            Self {
                accept,
                published: Mutex::new(Vec::new()),
                call_count: AtomicUsize::new(0),
            }
        }
    }

    impl Transport for FakeTransport {
        fn try_publish(&self, topic: &str, payload: Vec<u8>) -> crate::error::EngineResult<()> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            if self.accept {
                self.published.lock().unwrap().push((topic.to_string(), payload));
                Ok(())
            } else {
                Err(EngineError::TransportUnavailable("down".into()))
            }
        }
    }

    fn entry(key: &str, seq: u64) -> StorageEntry {
        StorageEntry::new_value(key.into(), "v".into(), seq, "n1".into(), seq).unwrap()
    }

    #[test]
    fn publishes_directly_when_transport_accepts() {
        let transport = Arc::new(FakeTransport::new(true));
        let outbox = Arc::new(Outbox::new(10, OverflowPolicy::DropOldest));
        let publisher = Publisher::new(transport.clone(), outbox.clone(), "mkv".into(), Duration::from_secs(1));

        publisher.publish_or_enqueue(&entry("k", 1));

        assert_eq!(transport.published.lock().unwrap().len(), 1);
        assert!(outbox.is_empty());
        assert!(outbox.is_online());
        assert!(outbox.last_flush_at_ms().is_some());
    }

    #[test]
    fn enqueues_when_transport_unavailable() {
        let transport = Arc::new(FakeTransport::new(false));
        let outbox = Arc::new(Outbox::new(10, OverflowPolicy::DropOldest));
        let publisher = Publisher::new(transport, outbox.clone(), "mkv".into(), Duration::from_secs(1));

        publisher.publish_or_enqueue(&entry("k", 1));

        assert_eq!(outbox.len(), 1);
        assert!(!outbox.is_online());
    }

    #[test]
    fn publish_or_enqueue_falls_back_to_outbox_on_mocked_transport_backpressure() {
        use crate::transport::MockTransport;

        let mut mock = MockTransport::new();
        mock.expect_try_publish()
            .times(1)
            .returning(|_, _| Err(EngineError::TransportUnavailable("mock backpressure".into())));
        let transport = Arc::new(mock);
        let outbox = Arc::new(Outbox::new(10, OverflowPolicy::DropOldest));
        let publisher = Publisher::new(transport, outbox.clone(), "mkv".into(), Duration::from_secs(1));

        publisher.publish_or_enqueue(&entry("k", 1));

        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn drain_stops_at_first_rejection_preserving_order() {
        let transport = Arc::new(FakeTransport::new(false));
        let outbox = Arc::new(Outbox::new(10, OverflowPolicy::DropOldest));
        outbox.enqueue((&entry("a", 1)).into()).unwrap();
        outbox.enqueue((&entry("b", 2)).into()).unwrap();
        let publisher = Publisher::new(transport, outbox.clone(), "mkv".into(), Duration::from_secs(1));

        publisher.drain_outbox_once();

        // Transport always rejects, so nothing should be acknowledged.
        assert_eq!(outbox.len(), 2);
    }

    #[test]
    fn drain_acknowledges_only_the_published_prefix() {
        let transport = Arc::new(FakeTransport::new(true));
        let outbox = Arc::new(Outbox::new(10, OverflowPolicy::DropOldest));
        outbox.enqueue((&entry("a", 1)).into()).unwrap();
        outbox.enqueue((&entry("b", 2)).into()).unwrap();
        let publisher = Publisher::new(transport.clone(), outbox.clone(), "mkv".into(), Duration::from_secs(1));

        publisher.drain_outbox_once();

        assert!(outbox.is_empty());
        assert_eq!(transport.published.lock().unwrap().len(), 2);
    }
}
