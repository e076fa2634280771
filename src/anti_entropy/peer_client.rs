//! # TCP Peer Client and Responder
//!
//! A minimal synchronous request/response transport for the anti-entropy
//! protocol, grounded in the teacher's own direct peer-to-peer sync design
//! (`Command::Sync { host, port }` connecting straight to another node's
//! address in `server.rs`) rather than routing through the MQTT event bus:
//! reconciliation is a point-to-point exchange with one configured peer,
//! not a fan-out broadcast, so a dedicated TCP connection per round fits
//! better than another pub/sub topic.
//!
//! Wire format is one JSON value per line in both directions — the same
//! newline-framed text shape the teacher's `protocol.rs` uses for the
//! client-facing command protocol, reused here for node-to-node traffic.

use super::protocol::{PeerClient, SyncKeysRequest, SyncKeysResponse, SyncRequest, SyncResponse};
use crate::codec::ReplicationEvent;
use crate::error::{EngineError, EngineResult};
use crate::merkle::MerkleTree;
use crate::storage::StorageEngine;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

/// How long a single request to a peer may take before giving up.
const PEER_IO_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
enum WireRequest {
    Level(SyncRequest),
    Keys(SyncKeysRequest),
}

#[derive(Debug, Serialize, Deserialize)]
enum WireResponse {
    Level(SyncResponse),
    Keys(SyncKeysResponse),
}

/// A [`PeerClient`] that opens one TCP connection per request to a peer's
/// anti-entropy responder.
pub struct TcpPeerClient {
    addr: String,
}

impl TcpPeerClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    fn roundtrip(&self, request: &WireRequest) -> EngineResult<WireResponse> {
        let stream = TcpStream::connect(&self.addr)
            .map_err(|e| EngineError::PeerUnreachable(format!("{}: {e}", self.addr)))?;
        stream
            .set_read_timeout(Some(PEER_IO_TIMEOUT))
            .map_err(|e| EngineError::PeerUnreachable(format!("{}: {e}", self.addr)))?;
        stream
            .set_write_timeout(Some(PEER_IO_TIMEOUT))
            .map_err(|e| EngineError::PeerUnreachable(format!("{}: {e}", self.addr)))?;

        let mut writer = stream.try_clone().map_err(|e| EngineError::PeerUnreachable(e.to_string()))?;
        let mut line = serde_json::to_string(request)
            .map_err(|e| EngineError::MalformedPayload(format!("encoding sync request: {e}")))?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .map_err(|e| EngineError::PeerUnreachable(format!("{}: {e}", self.addr)))?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        reader
            .read_line(&mut response_line)
            .map_err(|e| EngineError::PeerUnreachable(format!("{}: {e}", self.addr)))?;
        if response_line.is_empty() {
            return Err(EngineError::PeerUnreachable(format!("{} closed without a response", self.addr)));
        }
        serde_json::from_str(&response_line)
            .map_err(|e| EngineError::MalformedPayload(format!("decoding sync response: {e}")))
    }
}

impl PeerClient for TcpPeerClient {
    fn request_level(&self, request: SyncRequest) -> EngineResult<SyncResponse> {
        match self.roundtrip(&WireRequest::Level(request))? {
            WireResponse::Level(response) => Ok(response),
            WireResponse::Keys(_) => Err(EngineError::ProtocolError("expected a level response, got a keys response".into())),
        }
    }

    fn request_keys(&self, request: SyncKeysRequest) -> EngineResult<SyncKeysResponse> {
        match self.roundtrip(&WireRequest::Keys(request))? {
            WireResponse::Keys(response) => Ok(response),
            WireResponse::Level(_) => Err(EngineError::ProtocolError("expected a keys response, got a level response".into())),
        }
    }
}

/// Answer a single request on one connection against `storage`, then
/// close. `TcpPeerClient` opens one connection per request, so the
/// responder only ever needs to read one line and write one line back.
fn serve_connection<S: StorageEngine>(stream: TcpStream, storage: &Arc<S>) -> std::io::Result<()> {
    stream.set_read_timeout(Some(PEER_IO_TIMEOUT))?;
    stream.set_write_timeout(Some(PEER_IO_TIMEOUT))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(());
    }
    let request: WireRequest = match serde_json::from_str(&line) {
        Ok(r) => r,
        Err(e) => {
            warn!("anti-entropy responder: malformed request: {e}");
            return Ok(());
        }
    };
    let response = match request {
        WireRequest::Level(req) => {
            let tree = MerkleTree::rebuild_from(&storage.get_all());
            let hashes = tree
                .hashes_at_level(req.level)
                .map(|level_hashes| {
                    if req.parent_indices.is_empty() {
                        level_hashes.iter().enumerate().map(|(i, h)| (i, *h)).collect()
                    } else {
                        req.parent_indices
                            .iter()
                            .flat_map(|&p| [p * 2, p * 2 + 1])
                            .filter(|&i| i < level_hashes.len())
                            .map(|i| (i, level_hashes[i]))
                            .collect()
                    }
                })
                .unwrap_or_default();
            WireResponse::Level(SyncResponse {
                peer_height: tree.height(),
                level: req.level,
                hashes,
            })
        }
        WireRequest::Keys(req) => {
            let entries = req
                .keys
                .iter()
                .filter_map(|k| storage.get_any(k))
                .map(|e| ReplicationEvent::from(&e))
                .collect();
            WireResponse::Keys(SyncKeysResponse { entries })
        }
    };
    let mut out = serde_json::to_string(&response).unwrap_or_default();
    out.push('\n');
    writer.write_all(out.as_bytes())
}

/// Run the anti-entropy responder, accepting connections on a dedicated
/// blocking thread and handling each on its own thread — request volume
/// here is bounded by `peer_list` size and the reconciliation interval,
/// not by client traffic, so a thread-per-connection model is simple and
/// sufficient.
pub fn run_responder<S: StorageEngine + 'static>(bind_addr: String, storage: Arc<S>) -> std::io::Result<()> {
    let listener = TcpListener::bind(&bind_addr)?;
    info!("anti-entropy responder listening on {bind_addr}");
    std::thread::spawn(move || {
        for incoming in listener.incoming() {
            match incoming {
                Ok(stream) => {
                    let storage = storage.clone();
                    std::thread::spawn(move || {
                        if let Err(e) = serve_connection(stream, &storage) {
                            warn!("anti-entropy responder connection error: {e}");
                        }
                    });
                }
                Err(e) => warn!("anti-entropy responder accept error: {e}"),
            }
        }
    });
    Ok(())
}
