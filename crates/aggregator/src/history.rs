//! Append-only history of pipeline runs.
//!
//! Entries are buffered in memory and flushed to a JSONL file after each run.

use std::io::{BufRead, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sharecraft_core::{Digest, EpochId, LedgerHeight, PoolIndex};

/// A single entry in the history log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Global monotonic sequence number
    pub seq: u64,
    /// Wall clock, unix seconds
    pub recorded_at: u64,
    pub event: HistoryEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryEvent {
    /// A root became authoritative (or was found already committed)
    RootCommitted {
        pool_index: PoolIndex,
        epoch_id: EpochId,
        root: Digest,
        snapshot_height: LedgerHeight,
        holders: usize,
    },
    /// One reconciliation batch landed
    BatchApplied {
        pool_index: PoolIndex,
        epoch_id: EpochId,
        batch: usize,
        applied: usize,
        skipped: usize,
    },
    ManifestPublished {
        pool_index: PoolIndex,
        epoch_id: EpochId,
        root: Digest,
    },
    RunAborted {
        pool_index: PoolIndex,
        reason: String,
    },
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Default)]
pub struct HistoryLog {
    entries: Vec<HistoryEntry>,
    next_seq: u64,
    /// Number of entries already written to disk
    flushed_count: usize,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<HistoryEntry>) -> Self {
        let next_seq = entries.last().map_or(0, |e| e.seq + 1);
        let flushed_count = entries.len();
        Self {
            entries,
            next_seq,
            flushed_count,
        }
    }

    pub fn append(&mut self, event: HistoryEvent) {
        let entry = HistoryEntry {
            seq: self.next_seq,
            recorded_at: unix_now(),
            event,
        };
        debug!("Appended history entry seq={}", entry.seq);
        self.entries.push(entry);
        self.next_seq += 1;
    }

    /// Sequence number the next entry will get
    pub fn height(&self) -> u64 {
        self.next_seq
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Entries with `seq >= seq`
    pub fn since(&self, seq: u64) -> &[HistoryEntry] {
        let start = self.entries.partition_point(|e| e.seq < seq);
        &self.entries[start..]
    }

    fn unflushed(&self) -> &[HistoryEntry] {
        &self.entries[self.flushed_count..]
    }

    /// Append unflushed entries to a JSONL file. Returns how many were written.
    pub fn flush(&mut self, path: &Path) -> std::io::Result<usize> {
        let unflushed = self.unflushed();
        if unflushed.is_empty() {
            return Ok(0);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let count = unflushed.len();
        for entry in unflushed {
            let json = serde_json::to_string(entry)?;
            writeln!(file, "{}", json)?;
        }
        file.flush()?;
        self.flushed_count = self.entries.len();
        info!("Flushed {} history entries to {}", count, path.display());
        Ok(count)
    }

    /// Load a JSONL history file; a missing file is an empty log.
    ///
    /// Unparseable lines (such as a torn final write) are skipped.
    pub fn load(path: &Path) -> Self {
        let file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(_) => return Self::new(),
        };
        let reader = std::io::BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines().map_while(|r| r.ok()) {
            match serde_json::from_str::<HistoryEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping history line in {}: {}", path.display(), e),
            }
        }
        if !entries.is_empty() {
            info!("Loaded {} history entries from {}", entries.len(), path.display());
        }
        Self::from_entries(entries)
    }
}
