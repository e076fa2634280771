//! # Command Processor
//!
//! Executes a [`CommandRequest`] against Storage: validates, resolves
//! idempotency for mutations, allocates a sequence number, builds the
//! `StorageEntry`, applies it, and forwards it to the Publisher's
//! mutation channel (spec §4.8). Arithmetic and string-splice semantics
//! for `INCR`/`DECR`/`APPEND`/`PREPEND` are carried over from the
//! teacher's `RwLockEngine` (parse-as-i64-or-zero, concatenate-or-create).

use crate::command::envelope::{CommandOp, CommandOutcome, CommandRequest, CommandResponse, PairResult};
use crate::command::idempotency::IdempotencyCache;
use crate::error::EngineError;
use crate::lww;
use crate::storage::{StorageEngine, StorageEntry};
use log::warn;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::sequencer::Sequencer;

/// Spec-mandated upper bound on keys in a single `MGET` (spec §4.8).
const MAX_MULTI_GET_KEYS: usize = 256;
/// Spec-mandated upper bound on pairs in a single `MSET` (spec §4.8).
const MAX_MULTI_SET_PAIRS: usize = 100;

pub struct CommandProcessor<S: StorageEngine> {
    storage: Arc<S>,
    sequencer: Arc<Sequencer>,
    local_node_id: String,
    idempotency: IdempotencyCache,
    mutation_tx: Option<mpsc::Sender<StorageEntry>>,
}

impl<S: StorageEngine> CommandProcessor<S> {
    pub fn new(
        storage: Arc<S>,
        sequencer: Arc<Sequencer>,
        local_node_id: String,
        idempotency: IdempotencyCache,
        mutation_tx: Option<mpsc::Sender<StorageEntry>>,
    ) -> Self {
        Self {
            storage,
            sequencer,
            local_node_id,
            idempotency,
            mutation_tx,
        }
    }

    pub fn execute(&self, request: CommandRequest) -> CommandResponse {
        // Empty request ids bypass the idempotency cache entirely (spec
        // §4.8, §6: "empty disables idempotency") — every empty-id request
        // must execute fresh rather than sharing one cached slot keyed on
        // "".
        let idempotent = request.op.is_mutation() && !request.request_id.is_empty();

        if idempotent {
            if let Some(cached) = self.idempotency.get(&request.request_id) {
                return cached;
            }
        }

        let outcome = match self.try_execute(&request.op) {
            Ok(outcome) => outcome,
            Err(e) => CommandOutcome::Error {
                code: e.code() as i32,
                message: e.to_string(),
            },
        };

        let response = CommandResponse {
            request_id: request.request_id.clone(),
            outcome,
        };

        // Only a successful mutation response is cached; errors are not
        // (spec §4.8: "a repeat request returns the cached response...
        // Errors are not cached").
        if idempotent && !matches!(response.outcome, CommandOutcome::Error { .. }) {
            self.idempotency.insert(request.request_id, response.clone());
        }
        response
    }

    fn try_execute(&self, op: &CommandOp) -> Result<CommandOutcome, crate::error::EngineError> {
        match op {
            CommandOp::Get { key } => Ok(CommandOutcome::Value(self.storage.get(key).and_then(|e| e.value))),
            CommandOp::MultiGet { keys } => {
                if keys.len() > MAX_MULTI_GET_KEYS {
                    return Err(EngineError::InvalidRequest(format!(
                        "MGET carries {} keys, limit is {MAX_MULTI_GET_KEYS}",
                        keys.len()
                    )));
                }
                let values = keys.iter().map(|k| self.storage.get(k).and_then(|e| e.value)).collect();
                Ok(CommandOutcome::Values(values))
            }
            CommandOp::Set { key, value } => {
                self.put_value(key.clone(), value.clone())?;
                Ok(CommandOutcome::Ok)
            }
            CommandOp::Delete { key } => {
                self.apply_delete(key)?;
                Ok(CommandOutcome::Ok)
            }
            CommandOp::Increment { key, amount } => {
                let current = self.current_integer(key)?;
                let next = current + amount.unwrap_or(1);
                self.put_value(key.clone(), next.to_string())?;
                Ok(CommandOutcome::Integer(next))
            }
            CommandOp::Decrement { key, amount } => {
                let current = self.current_integer(key)?;
                let next = current - amount.unwrap_or(1);
                self.put_value(key.clone(), next.to_string())?;
                Ok(CommandOutcome::Integer(next))
            }
            CommandOp::Append { key, value } => {
                let current = self.storage.get(key).and_then(|e| e.value).unwrap_or_default();
                let next = format!("{current}{value}");
                self.put_value(key.clone(), next.clone())?;
                Ok(CommandOutcome::StringValue(next))
            }
            CommandOp::Prepend { key, value } => {
                let current = self.storage.get(key).and_then(|e| e.value).unwrap_or_default();
                let next = format!("{value}{current}");
                self.put_value(key.clone(), next.clone())?;
                Ok(CommandOutcome::StringValue(next))
            }
            CommandOp::MultiSet { pairs } => {
                if pairs.len() > MAX_MULTI_SET_PAIRS {
                    return Err(EngineError::InvalidRequest(format!(
                        "MSET carries {} pairs, limit is {MAX_MULTI_SET_PAIRS}",
                        pairs.len()
                    )));
                }
                // Each pair is applied independently — one pair's failure
                // must not abort the pairs after it (spec §4.8: "ordered
                // result list (per-pair success/error)").
                let results = pairs
                    .iter()
                    .map(|(key, value)| match self.put_value(key.clone(), value.clone()) {
                        Ok(()) => PairResult::Ok,
                        Err(e) => PairResult::Error {
                            code: e.code() as i32,
                            message: e.to_string(),
                        },
                    })
                    .collect();
                Ok(CommandOutcome::Results(results))
            }
        }
    }

    fn current_integer(&self, key: &str) -> Result<i64, crate::error::EngineError> {
        match self.storage.get(key).and_then(|e| e.value) {
            Some(v) => v
                .parse::<i64>()
                .map_err(|_| crate::error::EngineError::InvalidType),
            None => Ok(0),
        }
    }

    fn put_value(&self, key: String, value: String) -> Result<(), crate::error::EngineError> {
        let seq = self.sequencer.allocate()?;
        let entry = StorageEntry::new_value(key, value, lww::now_ms(), self.local_node_id.clone(), seq)?;
        self.storage.put(entry.clone())?;
        self.forward_mutation(entry);
        Ok(())
    }

    fn apply_delete(&self, key: &str) -> Result<(), crate::error::EngineError> {
        let seq = self.sequencer.allocate()?;
        self.storage
            .delete(key, lww::now_ms(), self.local_node_id.clone(), seq)?;
        if let Some(entry) = self.storage.get_any(key) {
            self.forward_mutation(entry);
        }
        Ok(())
    }

    fn forward_mutation(&self, entry: StorageEntry) {
        if let Some(tx) = &self.mutation_tx {
            if tx.try_send(entry).is_err() {
                warn!("mutation channel full or closed, publisher will miss this event until anti-entropy catches up");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::storage::InMemoryStorage;
    use std::time::Duration;

    fn processor() -> CommandProcessor<InMemoryStorage> {
        CommandProcessor::new(
            Arc::new(InMemoryStorage::new()),
            Arc::new(Sequencer::new("n1", 1)),
            "n1".into(),
            IdempotencyCache::new(100, Duration::from_secs(60)),
            None,
        )
    }

    fn req(id: &str, op: CommandOp) -> CommandRequest {
        CommandRequest {
            request_id: id.into(),
            op,
        }
    }

    #[test]
    fn set_then_get_round_trips() {
        let p = processor();
        p.execute(req("r1", CommandOp::Set { key: "k".into(), value: "v".into() }));
        let resp = p.execute(req("r2", CommandOp::Get { key: "k".into() }));
        assert_eq!(resp.outcome, CommandOutcome::Value(Some("v".into())));
    }

    #[test]
    fn get_missing_key_returns_none() {
        let p = processor();
        let resp = p.execute(req("r1", CommandOp::Get { key: "missing".into() }));
        assert_eq!(resp.outcome, CommandOutcome::Value(None));
    }

    #[test]
    fn delete_then_get_returns_none() {
        let p = processor();
        p.execute(req("r1", CommandOp::Set { key: "k".into(), value: "v".into() }));
        p.execute(req("r2", CommandOp::Delete { key: "k".into() }));
        let resp = p.execute(req("r3", CommandOp::Get { key: "k".into() }));
        assert_eq!(resp.outcome, CommandOutcome::Value(None));
    }

    #[test]
    fn increment_defaults_missing_key_to_zero() {
        let p = processor();
        let resp = p.execute(req("r1", CommandOp::Increment { key: "counter".into(), amount: None }));
        assert_eq!(resp.outcome, CommandOutcome::Integer(1));
    }

    #[test]
    fn increment_with_explicit_amount() {
        let p = processor();
        p.execute(req("r1", CommandOp::Increment { key: "counter".into(), amount: Some(10) }));
        let resp = p.execute(req("r2", CommandOp::Increment { key: "counter".into(), amount: Some(5) }));
        assert_eq!(resp.outcome, CommandOutcome::Integer(15));
    }

    #[test]
    fn decrement_subtracts() {
        let p = processor();
        p.execute(req("r1", CommandOp::Set { key: "counter".into(), value: "10".into() }));
        let resp = p.execute(req("r2", CommandOp::Decrement { key: "counter".into(), amount: Some(3) }));
        assert_eq!(resp.outcome, CommandOutcome::Integer(7));
    }

    #[test]
    fn increment_non_numeric_value_is_invalid_type() {
        let p = processor();
        p.execute(req("r1", CommandOp::Set { key: "k".into(), value: "not-a-number".into() }));
        let resp = p.execute(req("r2", CommandOp::Increment { key: "k".into(), amount: None }));
        match resp.outcome {
            CommandOutcome::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidType as i32),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn append_and_prepend_create_key_if_missing() {
        let p = processor();
        let r1 = p.execute(req("r1", CommandOp::Append { key: "s".into(), value: "world".into() }));
        assert_eq!(r1.outcome, CommandOutcome::StringValue("world".into()));

        let r2 = p.execute(req("r2", CommandOp::Prepend { key: "s".into(), value: "hello ".into() }));
        assert_eq!(r2.outcome, CommandOutcome::StringValue("hello world".into()));
    }

    #[test]
    fn multi_get_preserves_request_order() {
        let p = processor();
        p.execute(req("r1", CommandOp::Set { key: "a".into(), value: "1".into() }));
        p.execute(req("r2", CommandOp::Set { key: "b".into(), value: "2".into() }));
        let resp = p.execute(req(
            "r3",
            CommandOp::MultiGet { keys: vec!["a".into(), "missing".into(), "b".into()] },
        ));
        assert_eq!(
            resp.outcome,
            CommandOutcome::Values(vec![Some("1".into()), None, Some("2".into())])
        );
    }

    #[test]
    fn multi_set_applies_all_pairs() {
        let p = processor();
        let set_resp = p.execute(req(
            "r1",
            CommandOp::MultiSet { pairs: vec![("a".into(), "1".into()), ("b".into(), "2".into())] },
        ));
        assert_eq!(set_resp.outcome, CommandOutcome::Results(vec![PairResult::Ok, PairResult::Ok]));
        let resp = p.execute(req("r2", CommandOp::MultiGet { keys: vec!["a".into(), "b".into()] }));
        assert_eq!(resp.outcome, CommandOutcome::Values(vec![Some("1".into()), Some("2".into())]));
    }

    #[test]
    fn multi_set_one_bad_pair_does_not_abort_the_rest() {
        let p = processor();
        let oversized_key = "k".repeat(crate::storage::MAX_KEY_BYTES + 1);
        let resp = p.execute(req(
            "r1",
            CommandOp::MultiSet {
                pairs: vec![("a".into(), "1".into()), (oversized_key, "x".into()), ("b".into(), "2".into())],
            },
        ));
        match resp.outcome {
            CommandOutcome::Results(results) => {
                assert_eq!(results.len(), 3);
                assert_eq!(results[0], PairResult::Ok);
                assert!(matches!(results[1], PairResult::Error { .. }));
                assert_eq!(results[2], PairResult::Ok);
            }
            other => panic!("expected Results, got {other:?}"),
        }
        let get = p.execute(req("r2", CommandOp::MultiGet { keys: vec!["a".into(), "b".into()] }));
        assert_eq!(get.outcome, CommandOutcome::Values(vec![Some("1".into()), Some("2".into())]));
    }

    #[test]
    fn multi_get_over_limit_is_invalid_request() {
        let p = processor();
        let keys = (0..300).map(|i| format!("k{i}")).collect();
        let resp = p.execute(req("r1", CommandOp::MultiGet { keys }));
        match resp.outcome {
            CommandOutcome::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidRequest as i32),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn multi_set_over_limit_is_invalid_request() {
        let p = processor();
        let pairs = (0..150).map(|i| (format!("k{i}"), "v".into())).collect();
        let resp = p.execute(req("r1", CommandOp::MultiSet { pairs }));
        match resp.outcome {
            CommandOutcome::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidRequest as i32),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn empty_request_id_bypasses_idempotency_cache() {
        let p = processor();
        p.execute(req("", CommandOp::Increment { key: "counter".into(), amount: Some(1) }));
        p.execute(req("", CommandOp::Increment { key: "counter".into(), amount: Some(1) }));
        let check = p.execute(req("check", CommandOp::Get { key: "counter".into() }));
        // Both empty-id increments actually executed, unlike a cached replay.
        assert_eq!(check.outcome, CommandOutcome::Value(Some("2".into())));
    }

    #[test]
    fn error_responses_are_never_cached() {
        let p = processor();
        p.execute(req("k", CommandOp::Set { key: "k".into(), value: "not-a-number".into() }));
        let first = p.execute(req("dup", CommandOp::Increment { key: "k".into(), amount: None }));
        assert!(matches!(first.outcome, CommandOutcome::Error { .. }));

        // Fix the underlying value, then retry under the same request id.
        // If the error had been cached, this would incorrectly replay it.
        p.execute(req("fix", CommandOp::Set { key: "k".into(), value: "5".into() }));
        let second = p.execute(req("dup", CommandOp::Increment { key: "k".into(), amount: Some(1) }));
        assert_eq!(second.outcome, CommandOutcome::Integer(6));
    }

    #[test]
    fn repeated_request_id_replays_cached_response_without_reapplying() {
        let p = processor();
        let r1 = p.execute(req("dup", CommandOp::Increment { key: "counter".into(), amount: Some(1) }));
        let r2 = p.execute(req("dup", CommandOp::Increment { key: "counter".into(), amount: Some(1) }));
        assert_eq!(r1, r2);
        // If the second call had actually re-executed, counter would be 2.
        let check = p.execute(req("check", CommandOp::Get { key: "counter".into() }));
        assert_eq!(check.outcome, CommandOutcome::Value(Some("1".into())));
    }

    #[test]
    fn mutation_is_forwarded_to_publisher_channel() {
        let (tx, mut rx) = mpsc::channel(10);
        let p = CommandProcessor::new(
            Arc::new(InMemoryStorage::new()),
            Arc::new(Sequencer::new("n1", 1)),
            "n1".into(),
            IdempotencyCache::new(100, Duration::from_secs(60)),
            Some(tx),
        );
        p.execute(req("r1", CommandOp::Set { key: "k".into(), value: "v".into() }));
        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.key, "k");
        assert_eq!(entry.value, Some("v".into()));
    }
}
