//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: mirrored onto storage::LogStore, replicated by replication.rs, applied through state_machine.rs
//! what: LogEntry, LogProvider capability, LogManager (leader append, follower append, commit, apply)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{RaftError, RejectReason, StorageError};
use crate::pending::{CommitStatus, PendingCommits};
use crate::replication::ReplicationManager;
use crate::state::StateManager;
use crate::state_machine::StateMachine;
use crate::storage::LogStore;
use crate::NodeId;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed; 0 is the sentinel)
    pub index: u64,
    /// The command to be applied to the state machine
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, payload: Vec<u8>) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }

    /// The index-0 placeholder every log starts with. Never replicated.
    pub fn sentinel() -> Self {
        Self::new(0, 0, Vec::new())
    }
}

/// The narrow view of the log that the election and replication managers get.
pub trait LogProvider: Send + Sync {
    /// Number of entries including the sentinel, i.e. last index + 1.
    fn log_size(&self) -> u64;

    fn entry(&self, index: u64) -> Option<LogEntry>;

    fn commit_index(&self) -> u64;

    fn try_commit(&self);

    fn clear_pending_commits(&self);

    fn last_log_term(&self) -> u64 {
        self.entry(self.log_size().saturating_sub(1))
            .map(|entry| entry.term)
            .unwrap_or(0)
    }
}

struct LogInner {
    /// `entries[i].index == i`; entry 0 is the sentinel.
    entries: Vec<LogEntry>,
    store: Box<dyn LogStore>,
}

impl LogInner {
    fn last_index(&self) -> u64 {
        self.entries.len() as u64 - 1
    }
}

/// In-memory log mirrored 1:1 onto a [`LogStore`], plus commit/apply progress.
///
/// Locks: `log` guards the entries and the store, `state_machine` serializes
/// the apply loop and is always taken before `log`. Term and role are read
/// from [`StateManager`] under `log`; no other call leaves this component
/// with either lock held.
pub struct LogManager {
    node_id: NodeId,
    log: Mutex<LogInner>,
    commit_index: AtomicU64,
    last_applied: AtomicU64,
    state_machine: Mutex<Box<dyn StateMachine>>,
    pending: PendingCommits,
    state: Arc<StateManager>,
    replication: Arc<ReplicationManager>,
    commit_timeout: Duration,
}

impl LogManager {
    /// Rebuild the in-memory log from `store`.
    ///
    /// Records must run 1, 2, 3, ...; the first out-of-sequence record and
    /// everything after it are truncated away.
    pub fn open(
        node_id: NodeId,
        store: Box<dyn LogStore>,
        state_machine: Box<dyn StateMachine>,
        state: Arc<StateManager>,
        replication: Arc<ReplicationManager>,
        commit_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let mut entries = vec![LogEntry::sentinel()];
        for record in store.read_all()? {
            let expected = entries.len() as u64;
            if record.index != expected {
                warn!(
                    node = node_id,
                    found = record.index,
                    expected,
                    "unexpected index in stored log, truncating the rest"
                );
                store.truncate_suffix_from(expected - 1)?;
                break;
            }
            entries.push(record);
        }
        info!(node = node_id, last_index = entries.len() - 1, "log recovered");

        Ok(Self {
            node_id,
            log: Mutex::new(LogInner { entries, store }),
            commit_index: AtomicU64::new(0),
            last_applied: AtomicU64::new(0),
            state_machine: Mutex::new(state_machine),
            pending: PendingCommits::new(),
            state,
            replication,
            commit_timeout,
        })
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::SeqCst)
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::SeqCst)
    }

    pub fn log_size(&self) -> u64 {
        self.log.lock().entries.len() as u64
    }

    pub fn last_index(&self) -> u64 {
        self.log.lock().last_index()
    }

    pub fn last_term(&self) -> u64 {
        let log = self.log.lock();
        log.entries.last().map(|entry| entry.term).unwrap_or(0)
    }

    /// Entry at `index`; the sentinel is returned for 0.
    pub fn entry(&self, index: u64) -> Option<LogEntry> {
        self.log.lock().entries.get(index as usize).cloned()
    }

    /// Term of the entry at `index`, 0 when absent
    pub fn term_at(&self, index: u64) -> u64 {
        self.log
            .lock()
            .entries
            .get(index as usize)
            .map(|entry| entry.term)
            .unwrap_or(0)
    }

    /// Up to `count` of the newest entries, oldest first. Excludes the sentinel.
    pub fn recent_entries(&self, count: usize) -> Vec<LogEntry> {
        let log = self.log.lock();
        let start = log.entries.len().saturating_sub(count).max(1);
        log.entries[start..].to_vec()
    }

    /// The whole log, excluding the sentinel.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.log.lock().entries[1..].to_vec()
    }

    pub fn pending_commits(&self) -> usize {
        self.pending.len()
    }

    /// Leader-side client append.
    ///
    /// Durably appends `payload` at the next index, kicks replication and
    /// blocks until the entry is applied, the node steps down, or the commit
    /// timeout passes. A timeout does not roll anything back: the entry may
    /// still commit later.
    pub fn append(&self, payload: Vec<u8>) -> Result<u64, RaftError> {
        let Some(term) = self.state.leader_term() else {
            return Err(self.not_leader());
        };

        let appended = {
            let mut log = self.log.lock();
            // a step-down may have landed since the check above
            if self.state.leader_term() == Some(term) {
                let index = log.entries.len() as u64;
                if let Err(err) = log.store.append(term, index, &payload) {
                    error!(node = self.node_id, index, %err, "failed to persist log entry");
                    return Err(err.into());
                }
                log.entries.push(LogEntry::new(term, index, payload));
                // registered before the entry becomes visible to replication
                Some((index, self.pending.register(index)))
            } else {
                None
            }
        };
        let Some((index, handle)) = appended else {
            return Err(self.not_leader());
        };
        debug!(node = self.node_id, term, index, "appended client entry");

        // a step-down between the check and the register has already failed
        // the other waits; this one would otherwise sit out the full timeout
        if self.state.leader_term() != Some(term) {
            self.pending.fail(index);
        } else {
            self.replication.record_self_append(index);
            self.replication.trigger_replication();
            self.try_commit();
        }

        match self.pending.wait(&handle, self.commit_timeout) {
            CommitStatus::Committed => Ok(index),
            CommitStatus::Failed => Err(RaftError::CommitAborted { index }),
            CommitStatus::TimedOut | CommitStatus::Pending => {
                warn!(node = self.node_id, index, "commit wait timed out");
                Err(RaftError::CommitTimeout {
                    index,
                    timeout: self.commit_timeout,
                })
            }
        }
    }

    fn not_leader(&self) -> RaftError {
        RaftError::NotLeader {
            leader: self.replication.likely_leader(),
        }
    }

    /// Follower-side AppendEntries processing.
    ///
    /// Applies the log-matching check at `prev_index`, drops any conflicting
    /// suffix, durably appends the new entries and follows the leader's
    /// commit index. `term` is the sending leader's term; the request is
    /// refused if this node has moved past it.
    pub fn handle_append_entries(
        &self,
        term: u64,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> Result<(), RejectReason> {
        let advanced = {
            let mut log = self.log.lock();

            let current = self.state.current_term();
            if current > term {
                return Err(RejectReason::StaleTerm { term, current });
            }

            let last_index = log.last_index();
            if prev_index > last_index {
                return Err(RejectReason::PrevIndexOutOfBounds {
                    prev_index,
                    last_index,
                });
            }

            let local = log.entries[prev_index as usize].term;
            if local != prev_term {
                return Err(RejectReason::TermMismatch {
                    index: prev_index,
                    local,
                    leader: prev_term,
                });
            }

            let commit_index = self.commit_index();
            for entry in entries {
                if let Some(existing) = log.entries.get(entry.index as usize) {
                    if existing.term == entry.term {
                        continue;
                    }
                    if entry.index <= commit_index {
                        return Err(RejectReason::CommittedConflict {
                            index: entry.index,
                            commit_index,
                        });
                    }
                    log.store.truncate_suffix_from(entry.index - 1)?;
                    let dropped = log.entries.len() as u64 - entry.index;
                    log.entries.truncate(entry.index as usize);
                    warn!(
                        node = self.node_id,
                        from = entry.index,
                        dropped,
                        "truncated conflicting log suffix"
                    );
                }

                let next = log.entries.len() as u64;
                if entry.index != next {
                    return Err(RejectReason::IndexGap {
                        got: entry.index,
                        last_index: next - 1,
                    });
                }
                log.store.append(entry.term, entry.index, &entry.payload)?;
                log.entries.push(entry);
            }

            // commit index only moves while the log is locked
            let target = leader_commit.min(log.last_index());
            target > self.commit_index.fetch_max(target, Ordering::SeqCst)
        };

        if advanced {
            self.apply_committed();
        }
        Ok(())
    }

    /// Leader-only: advance the commit index over every current-term entry
    /// that a majority has matched, then apply.
    ///
    /// Entries from earlier terms are never counted directly; they commit
    /// when a later current-term entry does.
    pub fn try_commit(&self) {
        let Some(term) = self.state.leader_term() else {
            return;
        };

        let candidates: Vec<(u64, u64)> = {
            let log = self.log.lock();
            let from = self.commit_index() as usize + 1;
            log.entries
                .iter()
                .skip(from)
                .map(|entry| (entry.index, entry.term))
                .collect()
        };

        let majority = self.replication.majority();
        let Some(target) = candidates
            .into_iter()
            .filter(|&(_, entry_term)| entry_term == term)
            .map(|(index, _)| index)
            .filter(|&index| self.replication.count_replicas_with_index(index) >= majority)
            .max()
        else {
            return;
        };

        {
            let log = self.log.lock();
            let still_ours = log.entries.get(target as usize).map(|entry| entry.term) == Some(term);
            if !still_ours || self.state.leader_term() != Some(term) {
                debug!(node = self.node_id, index = target, "lost leadership before commit");
                return;
            }
            self.commit_index.fetch_max(target, Ordering::SeqCst);
        }

        debug!(node = self.node_id, commit_index = self.commit_index(), "commit index advanced");
        self.apply_committed();
    }

    /// Feed every committed but unapplied entry to the state machine, in
    /// order, one call per index.
    pub fn apply_committed(&self) {
        let mut machine = self.state_machine.lock();
        loop {
            let applied = self.last_applied.load(Ordering::SeqCst);
            if applied >= self.commit_index() {
                break;
            }

            let index = applied + 1;
            let Some(entry) = self.entry(index) else {
                error!(node = self.node_id, index, "committed entry missing from log");
                break;
            };

            if let Err(err) = machine.apply(&entry) {
                error!(node = self.node_id, index, %err, "state machine failed to apply entry");
            }
            self.last_applied.store(index, Ordering::SeqCst);
            self.pending.complete(index);
        }
    }

    /// Fail every client append still waiting to commit.
    pub fn clear_pending_commits(&self) {
        let failed = self.pending.fail_all();
        if failed > 0 {
            info!(node = self.node_id, failed, "failed pending commits");
        }
    }
}

impl LogProvider for LogManager {
    fn log_size(&self) -> u64 {
        LogManager::log_size(self)
    }

    fn entry(&self, index: u64) -> Option<LogEntry> {
        LogManager::entry(self, index)
    }

    fn commit_index(&self) -> u64 {
        LogManager::commit_index(self)
    }

    fn try_commit(&self) {
        LogManager::try_commit(self)
    }

    fn clear_pending_commits(&self) {
        LogManager::clear_pending_commits(self)
    }

    fn last_log_term(&self) -> u64 {
        self.last_term()
    }
}
