//! Log persistence (spec §1/§3.1: "treated as an opaque append-only store
//! with the operations listed in §3"). This module specifies that store's
//! interface plus two concrete adapters: a WAL-backed one grounded on the
//! teacher's `storage::WAL`, and an in-memory one for tests.
//!
//! A failure here is fatal (spec §4.6/§7): the caller is expected to log
//! at `error!` and abort the process, never to keep running on a store it
//! can no longer trust.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::LogStoreError;
use crate::types::{LogEntry, LogIndex, NodeId, Term};

/// The durable, append-only store backing `PersistentState` (spec §3.1).
/// Index 0 is never stored; `entries_from(1)` returns the whole log.
pub trait LogStore: Send {
    /// Highest index currently in the store (0 if empty).
    fn last_index(&self) -> LogIndex;

    /// Term of the entry at `last_index()` (0 if empty).
    fn last_term(&self) -> Term;

    /// Term of the entry at `index`, if any.
    fn term_at(&self, index: LogIndex) -> Option<Term>;

    /// Append `entries` starting at `start_index`, truncating any
    /// existing suffix first (AppendEntries conflict resolution, spec
    /// §4.2). Must be durable before returning `Ok`.
    fn append(&mut self, start_index: LogIndex, entries: &[LogEntry]) -> Result<(), LogStoreError>;

    /// Entries in `[from, last_index()]`, inclusive.
    fn entries_from(&self, from: LogIndex) -> Vec<LogEntry>;

    /// Persist `current_term`/`voted_for` (must happen-before any reply
    /// that depends on them, per Raft's durability rule).
    fn save_term_and_vote(
        &mut self,
        term: Term,
        voted_for: Option<NodeId>,
    ) -> Result<(), LogStoreError>;

    fn load_term_and_vote(&self) -> (Term, Option<NodeId>);
}

/// One durable record written to the WAL, mirroring the teacher's
/// `storage::WALEntry` but scoped to what this spec's log store actually
/// needs to persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum WalRecord {
    Entry { index: LogIndex, term: Term, payload: Vec<u8> },
    TruncateFrom { index: LogIndex },
    TermAndVote { term: Term, voted_for: Option<NodeId> },
}

/// Write-ahead-log-backed `LogStore`. Grounded on `storage::WAL`: a
/// length-prefixed bincode record stream, replayed in full on open.
pub struct FileLogStore {
    file: BufWriter<File>,
    entries: Vec<LogEntry>,
    current_term: Term,
    voted_for: Option<NodeId>,
    sync_on_write: bool,
}

impl FileLogStore {
    pub fn open(path: impl AsRef<Path>, sync_on_write: bool) -> Result<Self, LogStoreError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut entries: Vec<LogEntry> = Vec::new();
        let mut current_term: Term = 0;
        let mut voted_for: Option<NodeId> = None;

        if path.exists() {
            let file = File::open(&path)?;
            let mut reader = BufReader::new(file);
            loop {
                let mut len_bytes = [0u8; 4];
                match reader.read_exact(&mut len_bytes) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(LogStoreError::Io(e)),
                }
                let len = u32::from_le_bytes(len_bytes) as usize;
                let mut buf = vec![0u8; len];
                reader.read_exact(&mut buf)?;
                let record: WalRecord = bincode::deserialize(&buf)
                    .map_err(|e| LogStoreError::Corrupt(e.to_string()))?;
                apply_record(&mut entries, &mut current_term, &mut voted_for, record);
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            file: BufWriter::new(file),
            entries,
            current_term,
            voted_for,
            sync_on_write,
        })
    }

    fn write_record(&mut self, record: &WalRecord) -> Result<(), LogStoreError> {
        let bytes =
            bincode::serialize(record).map_err(|e| LogStoreError::Encode(e.to_string()))?;
        self.file.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.file.write_all(&bytes)?;
        if self.sync_on_write {
            self.file.flush()?;
            self.file.get_ref().sync_all()?;
        }
        Ok(())
    }
}

fn apply_record(
    entries: &mut Vec<LogEntry>,
    current_term: &mut Term,
    voted_for: &mut Option<NodeId>,
    record: WalRecord,
) {
    match record {
        WalRecord::Entry { index, term, payload } => {
            let pos = (index - 1) as usize;
            if pos < entries.len() {
                entries.truncate(pos);
            }
            entries.push(LogEntry { term, payload });
        }
        WalRecord::TruncateFrom { index } => {
            let pos = (index - 1) as usize;
            entries.truncate(pos);
        }
        WalRecord::TermAndVote { term, voted_for: vf } => {
            *current_term = term;
            *voted_for = vf;
        }
    }
}

impl LogStore for FileLogStore {
    fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entries.get((index - 1) as usize).map(|e| e.term)
    }

    fn append(&mut self, start_index: LogIndex, entries: &[LogEntry]) -> Result<(), LogStoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        if (start_index - 1) < self.entries.len() as LogIndex {
            self.write_record(&WalRecord::TruncateFrom { index: start_index })?;
            self.entries.truncate((start_index - 1) as usize);
        }
        for (i, entry) in entries.iter().enumerate() {
            let index = start_index + i as LogIndex;
            self.write_record(&WalRecord::Entry {
                index,
                term: entry.term,
                payload: entry.payload.clone(),
            })?;
            self.entries.push(entry.clone());
        }
        Ok(())
    }

    fn entries_from(&self, from: LogIndex) -> Vec<LogEntry> {
        if from == 0 || from > self.entries.len() as LogIndex {
            return Vec::new();
        }
        self.entries[(from - 1) as usize..].to_vec()
    }

    fn save_term_and_vote(
        &mut self,
        term: Term,
        voted_for: Option<NodeId>,
    ) -> Result<(), LogStoreError> {
        self.write_record(&WalRecord::TermAndVote { term, voted_for })?;
        self.current_term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn load_term_and_vote(&self) -> (Term, Option<NodeId>) {
        (self.current_term, self.voted_for)
    }
}

/// In-memory `LogStore` for tests — same semantics, no durability.
#[derive(Default)]
pub struct InMemoryLogStore {
    entries: Vec<LogEntry>,
    current_term: Term,
    voted_for: Option<NodeId>,
}

impl LogStore for InMemoryLogStore {
    fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entries.get((index - 1) as usize).map(|e| e.term)
    }

    fn append(&mut self, start_index: LogIndex, entries: &[LogEntry]) -> Result<(), LogStoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        self.entries.truncate((start_index - 1) as usize);
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn entries_from(&self, from: LogIndex) -> Vec<LogEntry> {
        if from == 0 || from > self.entries.len() as LogIndex {
            return Vec::new();
        }
        self.entries[(from - 1) as usize..].to_vec()
    }

    fn save_term_and_vote(
        &mut self,
        term: Term,
        voted_for: Option<NodeId>,
    ) -> Result<(), LogStoreError> {
        self.current_term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn load_term_and_vote(&self) -> (Term, Option<NodeId>) {
        (self.current_term, self.voted_for)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_appends_and_truncates() {
        let mut store = InMemoryLogStore::default();
        store
            .append(1, &[LogEntry { term: 1, payload: vec![1] }, LogEntry { term: 1, payload: vec![2] }])
            .unwrap();
        assert_eq!(store.last_index(), 2);
        assert_eq!(store.last_term(), 1);

        // Conflicting suffix at index 2 gets truncated and replaced.
        store
            .append(2, &[LogEntry { term: 2, payload: vec![9] }])
            .unwrap();
        assert_eq!(store.last_index(), 2);
        assert_eq!(store.entries_from(1)[1].term, 2);
    }

    #[test]
    fn file_log_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");

        {
            let mut store = FileLogStore::open(&path, true).unwrap();
            store
                .append(1, &[LogEntry { term: 1, payload: b"a".to_vec() }])
                .unwrap();
            store.save_term_and_vote(1, Some(7)).unwrap();
        }

        let reopened = FileLogStore::open(&path, true).unwrap();
        assert_eq!(reopened.last_index(), 1);
        assert_eq!(reopened.last_term(), 1);
        assert_eq!(reopened.load_term_and_vote(), (1, Some(7)));
    }

    #[test]
    fn file_log_store_replays_truncation_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");

        {
            let mut store = FileLogStore::open(&path, true).unwrap();
            store
                .append(
                    1,
                    &[
                        LogEntry { term: 1, payload: vec![1] },
                        LogEntry { term: 1, payload: vec![2] },
                    ],
                )
                .unwrap();
            store
                .append(2, &[LogEntry { term: 2, payload: vec![9] }])
                .unwrap();
        }

        let reopened = FileLogStore::open(&path, true).unwrap();
        assert_eq!(reopened.last_index(), 2);
        assert_eq!(reopened.entries_from(1)[1].term, 2);
    }
}
