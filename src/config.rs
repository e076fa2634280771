//! # Configuration
//!
//! Loads and defaults engine configuration from a TOML file, following
//! the teacher's `config` crate + `File::from(path)` pattern. Extends the
//! teacher's `host`/`port`/`replication`/`anti_entropy` sections with the
//! knobs the replication and consistency engine needs: the node's own
//! identity, LWW clock-skew tolerance, outbox sizing, idempotency cache
//! sizing, tombstone retention, and the anti-entropy rate limit.
//!
//! ## Example Configuration File (config.toml)
//! ```toml
//! host = "127.0.0.1"
//! port = 7379
//! node_id = "node1"
//! storage_path = "data"
//!
//! [replication]
//! enabled = true
//! mqtt_broker = "localhost"
//! mqtt_port = 1883
//! topic_prefix = "merkle_kv"
//! client_id = "node1"
//!
//! [anti_entropy]
//! enabled = true
//! interval_seconds = 60
//! rate_limit_per_sec = 5.0
//! listen_port = 7380
//! ```

use anyhow::Result;
use config::{Config as ConfigLib, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_true() -> bool {
    true
}

/// Configuration for anti-entropy synchronization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntiEntropyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_anti_entropy_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default)]
    pub peer_list: Vec<String>,
    /// Default requests/sec a single peer may issue against this node's
    /// anti-entropy protocol handler (spec §4.10).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: f64,
    /// Port the sync-request responder binds to, answering `SyncRequest`/
    /// `SyncKeysRequest` from peers listed in `peer_list`.
    #[serde(default = "default_anti_entropy_listen_port")]
    pub listen_port: u16,
}

fn default_anti_entropy_interval_seconds() -> u64 {
    60
}

fn default_anti_entropy_listen_port() -> u16 {
    7380
}

fn default_rate_limit_per_sec() -> f64 {
    5.0
}

/// Configuration for MQTT-based replication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub enabled: bool,
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    /// Final topics are `{topic_prefix}/events`.
    pub topic_prefix: String,
    /// Unique identifier for this node in MQTT communications. Should
    /// match `node_id` unless a deployment deliberately separates them.
    pub client_id: String,
    /// May be overridden at runtime by the `CLIENT_PASSWORD` environment
    /// variable.
    #[serde(default)]
    pub client_password: Option<String>,
    #[serde(default)]
    pub peer_list: Vec<String>,
}

/// Main configuration structure for a replication and consistency engine
/// node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// IP address to bind the command-envelope listener to.
    pub host: String,
    pub port: u16,
    /// This node's identity, used as `node_id` in every `StorageEntry`
    /// and `ReplicationEvent` this node produces.
    pub node_id: String,
    /// Directory holding the storage journal, sequencer state, and outbox
    /// file.
    pub storage_path: String,

    pub replication: ReplicationConfig,
    pub anti_entropy: AntiEntropyConfig,

    /// How far into the future a remote timestamp may claim to be before
    /// it's clamped (spec §4.3 default: 5 minutes).
    #[serde(default = "default_skew_max_future_ms")]
    pub skew_max_future_ms: u64,

    /// Maximum events the Outbox holds before applying its overflow
    /// policy (spec §4.5).
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,

    /// `"drop_oldest"` (default) or `"reject_newest"`.
    #[serde(default = "default_outbox_overflow_policy")]
    pub outbox_overflow_policy: String,

    /// Maximum entries the idempotency cache holds (spec §4.8).
    #[serde(default = "default_idempotency_capacity")]
    pub idempotency_capacity: usize,

    /// How long a cached command response remains valid for replay.
    #[serde(default = "default_idempotency_ttl_seconds")]
    pub idempotency_ttl_seconds: u64,

    /// How long a tombstone is retained before `gc_tombstones` removes it.
    #[serde(default = "default_tombstone_retention_hours")]
    pub tombstone_retention_hours: u64,
}

fn default_skew_max_future_ms() -> u64 {
    crate::lww::DEFAULT_SKEW_MAX_FUTURE_MS
}

fn default_outbox_capacity() -> usize {
    10_000
}

fn default_outbox_overflow_policy() -> String {
    "drop_oldest".to_string()
}

fn default_idempotency_capacity() -> usize {
    10_000
}

fn default_idempotency_ttl_seconds() -> u64 {
    300
}

fn default_tombstone_retention_hours() -> u64 {
    24
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let settings = ConfigLib::builder().add_source(File::from(path)).build()?;
        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn peer_list_len(&self) -> usize {
        self.anti_entropy.peer_list.len()
    }

    pub fn tombstone_retention_ms(&self) -> u64 {
        self.tombstone_retention_hours * 60 * 60 * 1000
    }

    pub fn outbox_overflow_policy(&self) -> crate::outbox::OverflowPolicy {
        match self.outbox_overflow_policy.as_str() {
            "reject_newest" => crate::outbox::OverflowPolicy::RejectNewest,
            _ => crate::outbox::OverflowPolicy::DropOldest,
        }
    }
}

impl Default for Config {
    /// Sensible development defaults: localhost:7379, node id "node1",
    /// data stored under "./data", replication disabled, anti-entropy
    /// enabled with a 60-second interval.
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7379,
            node_id: "node1".to_string(),
            storage_path: "data".to_string(),
            replication: ReplicationConfig {
                enabled: false,
                mqtt_broker: "localhost".to_string(),
                mqtt_port: 1883,
                topic_prefix: "merkle_kv".to_string(),
                client_id: "node1".to_string(),
                client_password: None,
                peer_list: vec![],
            },
            anti_entropy: AntiEntropyConfig {
                enabled: true,
                interval_seconds: 60,
                peer_list: vec![],
                rate_limit_per_sec: default_rate_limit_per_sec(),
                listen_port: default_anti_entropy_listen_port(),
            },
            skew_max_future_ms: default_skew_max_future_ms(),
            outbox_capacity: default_outbox_capacity(),
            outbox_overflow_policy: default_outbox_overflow_policy(),
            idempotency_capacity: default_idempotency_capacity(),
            idempotency_ttl_seconds: default_idempotency_ttl_seconds(),
            tombstone_retention_hours: default_tombstone_retention_hours(),
        }
    }
}
