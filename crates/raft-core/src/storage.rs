//! # storage
//!
//! why: let the consensus core persist its log and vote without knowing the medium
//! relations: implemented on disk by raft-storage; consumed by log.rs (LogStore) and state.rs (VoteStore)
//! what: LogStore and VoteStore traits, PersistentVoteState, in-memory implementations

use parking_lot::Mutex;

use crate::error::StorageError;
use crate::{LogEntry, NodeId};

/// Durable `{current_term, voted_for}` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistentVoteState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// Append-only log of `(term, index, payload)` records.
///
/// Implementations serialize their own writers, so every method takes `&self`.
/// A successful `append` or `truncate_suffix_from` has reached stable storage.
pub trait LogStore: Send + Sync {
    /// Append one record. `index` must be exactly `last_index() + 1`.
    fn append(&self, term: u64, index: u64, payload: &[u8]) -> Result<u64, StorageError>;

    /// Every record, in index order.
    fn read_all(&self) -> Result<Vec<LogEntry>, StorageError>;

    /// Remove every record with `index > index_exclusive`.
    fn truncate_suffix_from(&self, index_exclusive: u64) -> Result<(), StorageError>;

    fn last_index(&self) -> u64;

    fn last_term(&self) -> u64;
}

/// Durable term/vote record, replaced atomically on every write.
pub trait VoteStore: Send + Sync {
    /// The stored state, or `{0, None}` when nothing was ever written.
    fn read(&self) -> Result<PersistentVoteState, StorageError>;

    fn write(&self, current_term: u64, voted_for: Option<NodeId>) -> Result<(), StorageError>;
}

// -- in-memory implementations --

/// in-memory log store for tests and ephemeral nodes
///
/// enforces the same gap-free append rule as the on-disk log
#[derive(Debug, Default)]
pub struct MemLogStore {
    records: Mutex<Vec<LogEntry>>,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// seed the store as if `entries` had been appended before a restart
    pub fn with_entries(entries: Vec<LogEntry>) -> Self {
        Self {
            records: Mutex::new(entries),
        }
    }
}

impl LogStore for MemLogStore {
    fn append(&self, term: u64, index: u64, payload: &[u8]) -> Result<u64, StorageError> {
        let mut records = self.records.lock();
        let expected = records.last().map(|e| e.index).unwrap_or(0) + 1;
        if index != expected {
            return Err(StorageError::IndexMismatch {
                expected,
                got: index,
            });
        }
        records.push(LogEntry::new(term, index, payload.to_vec()));
        Ok(index)
    }

    fn read_all(&self) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self.records.lock().clone())
    }

    fn truncate_suffix_from(&self, index_exclusive: u64) -> Result<(), StorageError> {
        self.records.lock().retain(|e| e.index <= index_exclusive);
        Ok(())
    }

    fn last_index(&self) -> u64 {
        self.records.lock().last().map(|e| e.index).unwrap_or(0)
    }

    fn last_term(&self) -> u64 {
        self.records.lock().last().map(|e| e.term).unwrap_or(0)
    }
}

/// in-memory vote store; no persistence across restarts
#[derive(Debug, Default)]
pub struct MemVoteStore {
    state: Mutex<PersistentVoteState>,
}

impl MemVoteStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VoteStore for MemVoteStore {
    fn read(&self) -> Result<PersistentVoteState, StorageError> {
        Ok(*self.state.lock())
    }

    fn write(&self, current_term: u64, voted_for: Option<NodeId>) -> Result<(), StorageError> {
        *self.state.lock() = PersistentVoteState {
            current_term,
            voted_for,
        };
        Ok(())
    }
}
