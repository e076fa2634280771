//! # Correlator
//!
//! Matches outgoing requests (command forwarding, anti-entropy sync
//! phases) to their eventual responses across an async boundary, with a
//! per-operation-class timeout and a cap on outgoing payload size (spec
//! §4.11). Built on `tokio::sync::oneshot`, one per in-flight
//! correlation id, the same per-request-channel shape the teacher uses
//! for its MQTT event loop's internal bookkeeping.

use crate::error::{EngineError, EngineResult};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// Outgoing payloads larger than this are rejected before a request is
/// even registered (spec §4.11).
pub const MAX_OUTGOING_PAYLOAD_BYTES: usize = 512 * 1024;

/// Which timeout applies to a pending request, per spec §4.11's default
/// budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    SingleKey,
    MultiKey,
    Sync,
}

impl OperationClass {
    pub fn default_timeout(self) -> Duration {
        match self {
            OperationClass::SingleKey => Duration::from_secs(10),
            OperationClass::MultiKey => Duration::from_secs(20),
            OperationClass::Sync => Duration::from_secs(30),
        }
    }
}

/// Tracks in-flight requests awaiting a correlated response.
pub struct Correlator {
    pending: Mutex<HashMap<String, oneshot::Sender<Vec<u8>>>>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Validate `payload` against the outgoing size guard before a caller
    /// attempts to send it.
    pub fn check_outgoing_size(payload: &[u8]) -> EngineResult<()> {
        if payload.len() > MAX_OUTGOING_PAYLOAD_BYTES {
            return Err(EngineError::PayloadTooLarge(format!(
                "outgoing payload is {} bytes, limit is {}",
                payload.len(),
                MAX_OUTGOING_PAYLOAD_BYTES
            )));
        }
        Ok(())
    }

    /// Register a new in-flight request under `correlation_id`. The
    /// caller sends the outgoing request only after this succeeds, then
    /// awaits [`Correlator::wait_for`] on the same id.
    ///
    /// Fails with [`EngineError::InvalidRequest`] if `correlation_id` is
    /// already in flight — ids must be unique to the caller (e.g. a UUID
    /// or the command's `request_id`).
    fn register(&self, correlation_id: &str) -> EngineResult<oneshot::Receiver<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().expect("correlator lock poisoned");
        if pending.contains_key(correlation_id) {
            return Err(EngineError::InvalidRequest(format!(
                "correlation id {correlation_id} is already in flight"
            )));
        }
        pending.insert(correlation_id.to_string(), tx);
        Ok(rx)
    }

    /// Deliver a response for `correlation_id`. Returns `false` if no
    /// request is currently waiting on that id (already timed out, or a
    /// duplicate/unsolicited response from a peer).
    pub fn complete(&self, correlation_id: &str, payload: Vec<u8>) -> bool {
        let sender = self.pending.lock().expect("correlator lock poisoned").remove(correlation_id);
        match sender {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Register `correlation_id` and wait for its response, bounded by
    /// `class`'s default timeout. Cleans up the pending entry on timeout
    /// so a late response doesn't leak into a future request reusing the
    /// same id.
    pub async fn send_and_wait(&self, correlation_id: &str, class: OperationClass) -> EngineResult<Vec<u8>> {
        let rx = self.register(correlation_id)?;
        let timeout = class.default_timeout();

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(EngineError::Internal(format!(
                "correlator channel for {correlation_id} dropped without a response"
            ))),
            Err(_) => {
                self.pending.lock().expect("correlator lock poisoned").remove(correlation_id);
                Err(EngineError::Timeout(timeout))
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("correlator lock poisoned").len()
    }
}
