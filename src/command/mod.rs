//! # Command Module
//!
//! The structured request/response envelope and the processor that
//! executes it against Storage, with idempotent replay for retried
//! mutations (spec §4.8, §6).

pub mod envelope;
pub mod idempotency;
pub mod processor;

pub use envelope::{CommandOp, CommandOutcome, CommandRequest, CommandResponse, PairResult};
pub use idempotency::IdempotencyCache;
pub use processor::CommandProcessor;
