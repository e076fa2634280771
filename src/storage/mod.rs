//! # Storage Module
//!
//! The in-memory keyed map with tombstones that every other component
//! treats as the single source of truth (spec §4.2). `entry` defines the
//! `StorageEntry` record and its invariants, `engine` defines the
//! `StorageEngine` trait and the `InMemoryStorage` implementation, and
//! `journal` provides optional append-only persistence with per-record
//! digest verification.

pub mod engine;
pub mod entry;
pub mod journal;

pub use engine::{InMemoryStorage, StorageEngine, TOMBSTONE_RETENTION_MS};
pub use entry::{StorageEntry, MAX_KEY_BYTES, MAX_VALUE_BYTES};
pub use journal::{JournalLoadReport, StorageJournal};
