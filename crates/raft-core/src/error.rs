//! # error
//!
//! why: give every failure in the consensus core a name callers can match on
//! relations: returned by storage impls, the managers in log.rs/state.rs, and RaftNode
//! what: StorageError, TransportError, RejectReason, ConfigError, RaftError

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::NodeId;

/// Failures of the durable log store or the persistent vote store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An append did not target exactly `last_index + 1`.
    #[error("log index mismatch: expected {expected}, got {got}")]
    IndexMismatch { expected: u64, got: u64 },

    /// The record cannot be framed with a 32-bit length prefix.
    #[error("record of {len} bytes exceeds the maximum frame size")]
    RecordTooLarge { len: usize },

    /// Persisted state exists but cannot be trusted.
    #[error("corrupt persistent state: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Failures delivering an RPC to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("rpc to peer {0} timed out")]
    Timeout(NodeId),

    #[error("peer answered with an unexpected message kind")]
    UnexpectedResponse,
}

/// Why a follower refused an AppendEntries request.
///
/// These are protocol disagreements: the leader recovers from them by backing
/// off `next_index`, so they never reach clients.
#[derive(Debug, Error)]
pub enum RejectReason {
    #[error("request term {term} is behind the current term {current}")]
    StaleTerm { term: u64, current: u64 },

    #[error("prev_log_index {prev_index} is beyond the local log end {last_index}")]
    PrevIndexOutOfBounds { prev_index: u64, last_index: u64 },

    #[error("term mismatch at index {index}: local term {local}, leader term {leader}")]
    TermMismatch { index: u64, local: u64, leader: u64 },

    #[error("entry {got} would leave a gap after local index {last_index}")]
    IndexGap { got: u64, last_index: u64 },

    #[error("conflict at index {index} is at or below the commit index {commit_index}")]
    CommittedConflict { index: u64, commit_index: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Invalid cluster configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("node {0} is not a member of the cluster")]
    UnknownSelf(NodeId),

    #[error("node {0} is listed more than once")]
    DuplicateMember(NodeId),

    #[error("cluster has no members")]
    EmptyCluster,

    #[error("election timeout window {min}..{max} ms is empty")]
    InvalidElectionWindow { min: u64, max: u64 },

    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot read config: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced to the client-facing boundary of a node.
#[derive(Debug, Error)]
pub enum RaftError {
    /// This node cannot accept writes. `leader` is an advisory redirect hint.
    #[error("not leader (likely leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// The entry was durably appended but not applied within the wait window.
    /// It may still commit later.
    #[error("entry {index} was not committed within {timeout:?}")]
    CommitTimeout { index: u64, timeout: Duration },

    /// Leadership was lost while the entry was waiting to commit.
    #[error("entry {index} was abandoned when this node stepped down")]
    CommitAborted { index: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl RaftError {
    /// The likely leader to redirect a client to, when known.
    pub fn leader_hint(&self) -> Option<NodeId> {
        match self {
            RaftError::NotLeader { leader } => *leader,
            _ => None,
        }
    }
}
