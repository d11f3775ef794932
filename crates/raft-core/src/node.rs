//! # node
//!
//! why: one object per cluster member that owns the managers and answers peer rpcs
//! relations: builds state/log/replication/election, registers as transport::MessageHandler
//! what: RaftNode (construction, start/shutdown, rpc handlers, client append), NodeStatus

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::election::ElectionManager;
use crate::error::{RaftError, RejectReason};
use crate::log::{LogEntry, LogManager, LogProvider};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RaftMessage, VoteRequest, VoteResponse,
};
use crate::replication::{PeerStats, ReplicationManager};
use crate::state::{Role, StateManager};
use crate::state_machine::StateMachine;
use crate::storage::{LogStore, VoteStore};
use crate::transport::{MessageHandler, RaftTransport};
use crate::NodeId;

/// Point-in-time report of a node, serializable for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub leader: Option<NodeId>,
    pub pending_commits: usize,
    pub peers: Vec<PeerStats>,
}

impl NodeStatus {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// A single Raft node in the cluster
///
/// Background threads hold the managers, never the node itself, so dropping
/// the last handle shuts everything down.
pub struct RaftNode {
    config: Arc<ClusterConfig>,
    state: Arc<StateManager>,
    log: Arc<LogManager>,
    replication: Arc<ReplicationManager>,
    election: Arc<ElectionManager>,
    started: AtomicBool,
}

impl RaftNode {
    /// Recover persisted state and wire the managers together. Nothing runs
    /// until [`RaftNode::start`].
    pub fn new(
        config: ClusterConfig,
        log_store: Box<dyn LogStore>,
        vote_store: Box<dyn VoteStore>,
        transport: Arc<dyn RaftTransport>,
        state_machine: Box<dyn StateMachine>,
    ) -> Result<Arc<Self>, RaftError> {
        config.validate()?;
        let config = Arc::new(config);
        let node_id = config.node_id;

        let state = Arc::new(StateManager::new(node_id, vote_store)?);
        let replication = Arc::new(ReplicationManager::new(
            config.clone(),
            state.clone(),
            transport.clone(),
        ));
        let log = Arc::new(LogManager::open(
            node_id,
            log_store,
            state_machine,
            state.clone(),
            replication.clone(),
            config.raft.commit_timeout(),
        )?);
        let weak: Weak<LogManager> = Arc::downgrade(&log);
        let provider: Weak<dyn LogProvider> = weak;
        replication.attach_log(provider);

        let election = Arc::new(ElectionManager::new(
            config.clone(),
            state.clone(),
            replication.clone(),
            log.clone(),
            transport,
        ));

        info!(
            node = node_id,
            members = ?config.members,
            term = state.current_term(),
            last_index = log.last_index(),
            "raft node created"
        );

        Ok(Arc::new(Self {
            config,
            state,
            log,
            replication,
            election,
            started: AtomicBool::new(false),
        }))
    }

    /// Spawn the background threads and arm the election timer.
    pub fn start(&self) -> Result<(), RaftError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.replication.start()?;
        self.election.start()?;
        self.election.reset_election_timeout();
        info!(node = self.id(), "raft node started");
        Ok(())
    }

    /// Stop the background threads and fail outstanding client appends.
    pub fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.election.shutdown();
        self.replication.shutdown();
        self.log.clear_pending_commits();
        info!(node = self.id(), "raft node stopped");
    }

    // -- client surface --

    /// Append a command and block until it is committed and applied.
    ///
    /// Fails with [`RaftError::NotLeader`] (carrying a leader hint when one
    /// is known) on any node that does not currently lead.
    pub fn append_entry(&self, payload: impl Into<Vec<u8>>) -> Result<u64, RaftError> {
        self.log.append(payload.into())
    }

    /// Start an election now instead of waiting for the timer.
    pub fn campaign(&self) -> bool {
        self.election.run_election()
    }

    // -- rpc handlers --

    pub fn handle_request_vote(&self, request: VoteRequest) -> VoteResponse {
        if request.term > self.state.current_term() {
            self.replication.step_down(request.term);
        }

        let granted = self.candidate_log_is_current(&request)
            && match self.state.grant_vote(request.term, request.candidate_id) {
                Ok(granted) => granted,
                Err(err) => {
                    error!(node = self.id(), %err, "failed to persist vote");
                    false
                }
            };

        if granted {
            self.election.reset_election_timeout();
        }
        debug!(
            node = self.id(),
            candidate = request.candidate_id,
            term = request.term,
            granted,
            "vote request"
        );

        VoteResponse {
            term: self.state.current_term(),
            vote_granted: granted,
        }
    }

    /// A candidate's log must be at least as up-to-date as ours.
    fn candidate_log_is_current(&self, request: &VoteRequest) -> bool {
        let last_term = self.log.last_term();
        let last_index = self.log.last_index();
        request.last_log_term > last_term
            || (request.last_log_term == last_term && request.last_log_index >= last_index)
    }

    pub fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let (role, current) = self.state.snapshot();
        if request.term < current {
            return AppendEntriesResponse {
                term: current,
                success: false,
            };
        }

        if request.term > current {
            self.replication.step_down(request.term);
        } else if role == Role::Leader {
            warn!(
                node = self.id(),
                other = request.leader_id,
                term = current,
                "append entries from another leader in our term"
            );
            return AppendEntriesResponse {
                term: current,
                success: false,
            };
        } else if role == Role::Candidate {
            if let Err(err) = self.state.become_follower(request.term) {
                error!(node = self.id(), %err, "failed to step down from candidacy");
            }
        }

        self.election.reset_election_timeout();
        self.replication.record_leader_heartbeat(request.leader_id);

        let success = match self.log.handle_append_entries(
            request.term,
            request.prev_log_index,
            request.prev_log_term,
            request.entries,
            request.leader_commit,
        ) {
            Ok(()) => true,
            Err(RejectReason::Storage(err)) => {
                error!(node = self.id(), %err, "failed to persist replicated entries");
                false
            }
            Err(reason) => {
                debug!(node = self.id(), leader = request.leader_id, %reason, "append entries rejected");
                false
            }
        };

        AppendEntriesResponse {
            term: self.state.current_term(),
            success,
        }
    }

    // -- accessors --

    pub fn id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.state.role()
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    pub fn current_term(&self) -> u64 {
        self.state.current_term()
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.state.voted_for()
    }

    pub fn commit_index(&self) -> u64 {
        self.log.commit_index()
    }

    pub fn last_applied(&self) -> u64 {
        self.log.last_applied()
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.log.entries()
    }

    pub fn recent_entries(&self, count: usize) -> Vec<LogEntry> {
        self.log.recent_entries(count)
    }

    pub fn likely_leader(&self) -> Option<NodeId> {
        self.replication.likely_leader()
    }

    pub fn peer_stats(&self) -> Vec<PeerStats> {
        self.replication.peer_stats()
    }

    pub fn replication(&self) -> &ReplicationManager {
        &self.replication
    }

    pub fn status(&self) -> NodeStatus {
        let (role, term) = self.state.snapshot();
        NodeStatus {
            node_id: self.id(),
            role,
            term,
            voted_for: self.state.voted_for(),
            commit_index: self.log.commit_index(),
            last_applied: self.log.last_applied(),
            last_log_index: self.log.last_index(),
            leader: self.replication.likely_leader(),
            pending_commits: self.log.pending_commits(),
            peers: self.replication.peer_stats(),
        }
    }
}

impl MessageHandler for RaftNode {
    fn handle_message(&self, message: RaftMessage) -> Option<RaftMessage> {
        match message {
            RaftMessage::VoteRequest(request) => Some(self.handle_request_vote(request).into()),
            RaftMessage::AppendEntries(request) => {
                Some(self.handle_append_entries(request).into())
            }
            RaftMessage::VoteResponse(_) | RaftMessage::AppendEntriesResponse(_) => None,
        }
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}
