//! # merkle_kv
//!
//! Replication and consistency engine for a distributed, MQTT-backed
//! key-value store: an in-memory LWW store, a Merkle-tree-backed
//! anti-entropy protocol, and the plumbing (outbox, sequencer,
//! correlator, idempotency cache) that gets mutations from one node's
//! Storage to every other node's Storage at least once, in a stable
//! order, without unbounded memory growth.

pub mod anti_entropy;
pub mod applicator;
pub mod codec;
pub mod command;
pub mod config;
pub mod correlator;
pub mod error;
pub mod ingress;
pub mod lww;
pub mod merkle;
pub mod outbox;
pub mod publisher;
pub mod sequencer;
pub mod stats;
pub mod storage;
pub mod transport;

pub use command::{CommandOp, CommandOutcome, CommandProcessor, CommandRequest, CommandResponse};
pub use config::Config;
pub use error::{EngineError, EngineResult, ErrorCode};
pub use merkle::MerkleTree;
pub use storage::{InMemoryStorage, StorageEngine, StorageEntry};
