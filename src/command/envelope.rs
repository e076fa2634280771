//! # Command Envelope
//!
//! The structured request/response pair the Command Processor operates on
//! (spec §6), replacing the teacher's text protocol (`protocol.rs`) with a
//! typed envelope that carries a client-supplied `request_id` for
//! idempotent retries. Operation names and semantics (`GET`, `SET`,
//! `DEL`, `INCR`/`DECR` with an optional amount, `APPEND`/`PREPEND`,
//! `MGET`/`MSET`) are carried over unchanged from the teacher's
//! `protocol::Command`.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};

/// A single client operation, addressed by `request_id` for idempotency
/// and dedup across retried deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub request_id: String,
    pub op: CommandOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOp {
    Get { key: String },
    Set { key: String, value: String },
    Delete { key: String },
    Increment { key: String, amount: Option<i64> },
    Decrement { key: String, amount: Option<i64> },
    Append { key: String, value: String },
    Prepend { key: String, value: String },
    MultiGet { keys: Vec<String> },
    MultiSet { pairs: Vec<(String, String)> },
}

impl CommandOp {
    /// Whether this operation mutates Storage — used to decide whether a
    /// response needs to be idempotency-cached and whether it produces a
    /// replication event.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, CommandOp::Get { .. } | CommandOp::MultiGet { .. })
    }

    /// Which timeout class this operation belongs to (spec §4.11): single
    /// key vs. multi-key requests get different correlator timeouts.
    pub fn is_multi_key(&self) -> bool {
        matches!(self, CommandOp::MultiGet { .. } | CommandOp::MultiSet { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub request_id: String,
    pub outcome: CommandOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    /// A single value result, `None` for a miss.
    Value(Option<String>),
    /// Results for `MultiGet`, one per requested key, in request order.
    Values(Vec<Option<String>>),
    /// Successful mutation with no value to report.
    Ok,
    /// Result of an `Increment`/`Decrement`.
    Integer(i64),
    /// Result of an `Append`/`Prepend`.
    StringValue(String),
    /// Per-pair results for `MultiSet`, one per requested pair, in request
    /// order. A pair's own failure never aborts the pairs after it.
    Results(Vec<PairResult>),
    Error { code: i32, message: String },
}

/// The outcome of a single pair within a `MultiSet`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairResult {
    Ok,
    Error { code: i32, message: String },
}

impl CommandResponse {
    pub fn error(request_id: String, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            request_id,
            outcome: CommandOutcome::Error {
                code: code as i32,
                message: message.into(),
            },
        }
    }
}
