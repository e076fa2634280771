//! # merkle_kv node bootstrap
//!
//! Wires the library's components into a running node: loads
//! configuration, opens journaled storage and the sequencer, starts the
//! MQTT transport when replication is enabled, and spawns the
//! Publisher/Applicator tasks plus the periodic tombstone GC and
//! anti-entropy tree rebuild. Argument parsing uses `clap::Parser`
//! instead of the teacher's hand-rolled loop; runtime bootstrap
//! (`env_logger::init()`, a multi-thread Tokio runtime) is unchanged.

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use merkle_kv::anti_entropy::{AntiEntropySession, TcpPeerClient};
use merkle_kv::applicator::Applicator;
use merkle_kv::command::{CommandProcessor, IdempotencyCache};
use merkle_kv::config::Config;
use merkle_kv::publisher::Publisher;
use merkle_kv::sequencer::Sequencer;
use merkle_kv::storage::{InMemoryStorage, StorageEngine};
use merkle_kv::transport::MqttTransport;
use merkle_kv::{anti_entropy, ingress};

/// Mutation channel depth between the Command Processor and the
/// Publisher. Bounded so a stalled Publisher applies backpressure to
/// writers rather than growing memory without limit.
const MUTATION_CHANNEL_DEPTH: usize = 4096;
/// Depth of the channel carrying raw incoming MQTT payloads to the
/// Applicator.
const INCOMING_CHANNEL_DEPTH: usize = 4096;
/// How often the tombstone GC sweep runs, independent of how long a
/// tombstone is retained once swept.
const TOMBSTONE_GC_INTERVAL: Duration = Duration::from_secs(3600);
/// How often an `EngineStats` snapshot is logged, when both replication
/// and anti-entropy are enabled.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "merkle_kv", about = "Replication and consistency engine node")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the configured storage path.
    #[arg(long)]
    storage_path: Option<String>,

    /// Override the configured node id.
    #[arg(long)]
    node_id: Option<String>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = if args.config.exists() {
        Config::load(&args.config).with_context(|| format!("loading config from {:?}", args.config))?
    } else {
        warn!("config file {:?} not found, using defaults", args.config);
        Config::default()
    };

    if let Some(path) = args.storage_path {
        config.storage_path = path;
    }
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    std::fs::create_dir_all(&config.storage_path)
        .with_context(|| format!("creating storage directory {:?}", config.storage_path))?;

    let journal_path = PathBuf::from(&config.storage_path).join("storage.journal");
    let (storage, report) =
        InMemoryStorage::open_with_journal(&journal_path).context("opening storage journal")?;
    info!(
        "storage recovered: {} records applied, {} skipped as corrupt",
        report.records_applied, report.records_skipped_corrupt
    );
    let storage = Arc::new(storage);

    let sequencer_path = PathBuf::from(&config.storage_path).join("sequencer.bin");
    let sequencer = Arc::new(Sequencer::open(&sequencer_path, config.node_id.clone(), None)?);

    let idempotency = IdempotencyCache::new(
        config.idempotency_capacity,
        Duration::from_secs(config.idempotency_ttl_seconds),
    );

    let (mutation_tx, mutation_rx) = mpsc::channel(MUTATION_CHANNEL_DEPTH);
    let processor = Arc::new(CommandProcessor::new(
        storage.clone(),
        sequencer.clone(),
        config.node_id.clone(),
        idempotency,
        Some(mutation_tx),
    ));

    let ingress_addr = format!("{}:{}", config.host, config.port);
    tokio::spawn(async move {
        if let Err(e) = ingress::run(&ingress_addr, processor).await {
            error!("command ingress stopped: {e}");
        }
    });

    let mut replication_stats: Option<(Arc<Applicator<InMemoryStorage>>, Arc<merkle_kv::outbox::Outbox>)> = None;

    if config.replication.enabled {
        let outbox_path = PathBuf::from(&config.storage_path).join("outbox.bin");
        let outbox = Arc::new(merkle_kv::outbox::Outbox::open(
            &outbox_path,
            config.outbox_capacity,
            config.outbox_overflow_policy(),
        )?);

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CHANNEL_DEPTH);
        let transport = Arc::new(
            MqttTransport::connect(
                &config.replication.mqtt_broker,
                config.replication.mqtt_port,
                &config.replication.client_id,
                &config.replication.topic_prefix,
                incoming_tx,
            )
            .await
            .context("connecting to mqtt broker")?,
        );

        let publisher = Arc::new(Publisher::new(
            transport,
            outbox.clone(),
            config.replication.topic_prefix.clone(),
            Duration::from_secs(5),
        ));
        tokio::spawn(publisher.run(mutation_rx));

        let applicator = Arc::new(Applicator::new(
            storage.clone(),
            config.node_id.clone(),
            config.skew_max_future_ms,
        ));
        tokio::spawn(applicator.clone().run(incoming_rx));
        replication_stats = Some((applicator, outbox));

        info!(
            "replication enabled, connected to {}:{}",
            config.replication.mqtt_broker, config.replication.mqtt_port
        );
    } else {
        info!("replication disabled, running single-node");
    }

    let mut anti_entropy_session: Option<Arc<AntiEntropySession<InMemoryStorage>>> = None;

    if config.anti_entropy.enabled {
        let responder_addr = format!("{}:{}", config.host, config.anti_entropy.listen_port);
        anti_entropy::run_responder(responder_addr, storage.clone())
            .context("starting anti-entropy responder")?;

        let session = Arc::new(AntiEntropySession::with_rate_limit(
            storage.clone(),
            config.skew_max_future_ms,
            config.anti_entropy.rate_limit_per_sec,
        ));
        anti_entropy_session = Some(session.clone());
        let interval = Duration::from_secs(config.anti_entropy.interval_seconds);
        let peer_list = config.anti_entropy.peer_list.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let tree = session.build_tree();
                info!(
                    "anti-entropy tick: {} keys, root hash present: {}",
                    tree.len(),
                    tree.root_hash().is_some()
                );

                for peer_addr in &peer_list {
                    let session = session.clone();
                    let peer_addr = peer_addr.clone();
                    // Each peer's request/response round is blocking I/O
                    // (`TcpPeerClient`), so it runs on a blocking thread
                    // rather than stalling this task's executor.
                    let result = tokio::task::spawn_blocking(move || {
                        let peer = TcpPeerClient::new(peer_addr.clone());
                        session.reconcile(&peer_addr, &peer)
                    })
                    .await;

                    match result {
                        Ok(Ok(report)) => info!(
                            "anti-entropy reconciled with {peer_addr}: {} divergent, {} applied, {} kept local",
                            report.keys_compared_divergent, report.keys_applied_from_peer, report.keys_kept_local
                        ),
                        Ok(Err(e)) => warn!("anti-entropy reconciliation with {peer_addr} failed: {e}"),
                        Err(e) => warn!("anti-entropy reconciliation task with {peer_addr} panicked: {e}"),
                    }
                }
            }
        });
    }

    let gc_storage = storage.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TOMBSTONE_GC_INTERVAL);
        loop {
            ticker.tick().await;
            let removed = gc_storage.gc_tombstones(merkle_kv::lww::now_ms());
            if removed > 0 {
                info!("tombstone gc: removed {removed} tombstones");
            }
        }
    });

    if let (Some((applicator, outbox)), Some(anti_entropy_session)) = (replication_stats, anti_entropy_session) {
        let sequencer = sequencer.clone();
        let engine_stats = merkle_kv::stats::EngineStats::new();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_LOG_INTERVAL);
            loop {
                ticker.tick().await;
                let snapshot = engine_stats.snapshot(
                    applicator.as_ref(),
                    outbox.as_ref(),
                    sequencer.as_ref(),
                    anti_entropy_session.as_ref(),
                );
                info!(
                    "stats: uptime={}s applied={} stale_dup={} lww_rejected={} outbox_len={} outbox_online={} seq_allocations={} anti_entropy_rounds={}",
                    snapshot.uptime_seconds,
                    snapshot.applicator.events_applied,
                    snapshot.applicator.events_stale_duplicate,
                    snapshot.applicator.events_lww_rejected,
                    snapshot.outbox_len,
                    snapshot.outbox_online,
                    snapshot.sequencer_allocations,
                    snapshot.anti_entropy_rounds_completed,
                );
            }
        });
    }

    info!("node {} started", config.node_id);
    std::future::pending::<()>().await;
    Ok(())
}
