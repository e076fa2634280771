//! # Anti-Entropy Protocol
//!
//! Two-phase reconciliation against a peer's Merkle tree (spec §4.10):
//! `Sync` walks one tree level at a time from the root down, comparing
//! hashes to find divergent subtree indices without ever transferring the
//! whole key space; once the walk bottoms out at the leaf level,
//! `SyncKeys` fetches the actual entries for the small set of keys that
//! diverged. Grounded in the request/response actor-handle shape used for
//! Merkle comparison elsewhere in the ecosystem (`content_hash`,
//! `compute_diff`, `get_keys_in_range`), but expressed here as a plain
//! synchronous algorithm driving an injected [`PeerClient`] rather than an
//! actor, since the tree itself is already behind Storage's lock and needs
//! no actor of its own.

use crate::codec::ReplicationEvent;
use crate::error::{EngineError, EngineResult};
use crate::merkle::MerkleTree;
use serde::{Deserialize, Serialize};

/// Request for the hashes at a single tree level, restricted to the given
/// parent indices (the full level on the first request, when
/// `parent_indices` is empty).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub level: usize,
    pub parent_indices: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    /// The peer's tree height, so the requester can detect a height
    /// mismatch (the peer has more or fewer levels) before comparing.
    pub peer_height: usize,
    pub level: usize,
    pub hashes: Vec<(usize, [u8; 32])>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncKeysRequest {
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncKeysResponse {
    pub entries: Vec<ReplicationEvent>,
}

/// What the anti-entropy driver needs from a peer connection. A real
/// implementation sends these requests over the Correlator/Transport
/// pair; tests substitute an in-memory peer backed by a second
/// [`MerkleTree`].
pub trait PeerClient {
    fn request_level(&self, request: SyncRequest) -> EngineResult<SyncResponse>;
    fn request_keys(&self, request: SyncKeysRequest) -> EngineResult<SyncKeysResponse>;
}

/// How many divergent indices may be outstanding before this engine gives
/// up and reports a protocol error rather than walking an unbounded tree
/// (a pathological peer claiming every subtree diverges).
const MAX_DIVERGENT_INDICES: usize = 100_000;

/// Walk `local` against a peer's tree level by level, returning the keys
/// whose leaf hash differs between the two sides.
pub fn find_divergent_keys(local: &MerkleTree, peer: &dyn PeerClient) -> EngineResult<Vec<String>> {
    if local.is_empty() {
        // Nothing of our own to compare a tree level against; the driver
        // in `mod.rs` falls back to a full key fetch in this case rather
        // than calling this function.
        return Ok(Vec::new());
    }

    let top = local.height() - 1;
    let root_response = peer.request_level(SyncRequest { level: top, parent_indices: vec![] })?;

    if root_response.peer_height != local.height() {
        return Err(EngineError::IncompatibleVersion(format!(
            "local tree height {} differs from peer height {}",
            local.height(),
            root_response.peer_height
        )));
    }

    let local_root = local.hashes_at_level(top).unwrap();
    let peer_root = root_response.hashes.first().map(|(_, h)| *h);
    if peer_root == Some(local_root[0]) {
        return Ok(Vec::new());
    }

    let mut divergent_indices = vec![0usize];
    for level in (0..top).rev() {
        let response = peer.request_level(SyncRequest {
            level,
            parent_indices: divergent_indices.clone(),
        })?;

        let local_level = local
            .hashes_at_level(level)
            .ok_or_else(|| EngineError::ProtocolError(format!("local tree has no level {level}")))?;

        let mut next = Vec::new();
        for &parent in &divergent_indices {
            for child in [parent * 2, parent * 2 + 1] {
                if child >= local_level.len() {
                    continue;
                }
                let peer_hash = response.hashes.iter().find(|(idx, _)| *idx == child).map(|(_, h)| *h);
                if peer_hash != Some(local_level[child]) {
                    next.push(child);
                }
            }
        }
        if next.len() > MAX_DIVERGENT_INDICES {
            return Err(EngineError::ProtocolError(format!(
                "too many divergent subtrees at level {level} ({}), refusing to continue",
                next.len()
            )));
        }
        divergent_indices = next;
        if divergent_indices.is_empty() {
            break;
        }
    }

    let keys = divergent_indices
        .iter()
        .flat_map(|&idx| local.keys_in_subtree(0, idx).to_vec())
        .collect();
    Ok(keys)
}

/// Fetch the peer's entries for `keys` and return them for the caller
/// (typically the Applicator) to LWW-resolve against local Storage.
pub fn fetch_keys(peer: &dyn PeerClient, keys: Vec<String>) -> EngineResult<Vec<ReplicationEvent>> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let response = peer.request_keys(SyncKeysRequest { keys })?;
    Ok(response.entries)
}
