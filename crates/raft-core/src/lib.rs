//! # raft-core
//!
//! why: implement the raft consensus core that backs the replicated key/value and document store
//! relations: raft-storage provides the on-disk LogStore/VoteStore; embedders supply a RaftTransport and StateMachine
//! what: state/election/replication/log managers, rpc message shapes, commit wait-registry, RaftNode wiring

pub mod config;
pub mod election;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod pending;
pub mod replication;
pub mod state;
pub mod state_machine;
pub mod storage;
pub mod transport;

/// Identifier of a cluster member.
pub type NodeId = u64;

pub use config::{ClusterConfig, RaftConfig};
pub use error::{ConfigError, RaftError, RejectReason, StorageError, TransportError};
pub use log::{LogEntry, LogManager, LogProvider};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, RaftMessage, VoteRequest, VoteResponse,
};
pub use node::{NodeStatus, RaftNode};
pub use replication::{PeerProgress, PeerStats, ReplicationManager};
pub use state::{Role, StateManager};
pub use state_machine::{KvStore, StateMachine};
pub use storage::{LogStore, MemLogStore, MemVoteStore, PersistentVoteState, VoteStore};
pub use transport::{LocalNetwork, MessageHandler, RaftTransport};
