//! # state
//!
//! why: own the term/role/vote triple; the only place a node's role or term changes
//! relations: persisted through storage::VoteStore; read and driven by election, replication, log and node
//! what: Role enum, StateManager with follower/candidate/leader transitions and the vote-grant gate

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StorageError;
use crate::storage::{PersistentVoteState, VoteStore};
use crate::NodeId;

/// The three possible roles a Raft node can hold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

#[derive(Debug)]
struct Inner {
    current_term: u64,
    voted_for: Option<NodeId>,
    role: Role,
}

/// Term, role and vote of one node behind a single critical section.
///
/// Every transition is read-modify-write under that section, and term/vote
/// changes reach the vote store before they become visible. Role is never
/// persisted; a restarted node is always a follower.
pub struct StateManager {
    node_id: NodeId,
    store: Box<dyn VoteStore>,
    inner: Mutex<Inner>,
}

impl StateManager {
    /// Load the persisted term and vote. A corrupt vote file is fatal.
    pub fn new(node_id: NodeId, store: Box<dyn VoteStore>) -> Result<Self, StorageError> {
        let PersistentVoteState {
            current_term,
            voted_for,
        } = store.read()?;
        debug!(node = node_id, current_term, ?voted_for, "loaded persistent vote state");

        Ok(Self {
            node_id,
            store,
            inner: Mutex::new(Inner {
                current_term,
                voted_for,
                role: Role::Follower,
            }),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn current_term(&self) -> u64 {
        self.inner.lock().current_term
    }

    pub fn role(&self) -> Role {
        self.inner.lock().role
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.inner.lock().voted_for
    }

    /// Role and term read together.
    pub fn snapshot(&self) -> (Role, u64) {
        let inner = self.inner.lock();
        (inner.role, inner.current_term)
    }

    /// The current term if, and only if, this node leads it.
    pub fn leader_term(&self) -> Option<u64> {
        let inner = self.inner.lock();
        (inner.role == Role::Leader).then_some(inner.current_term)
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn is_candidate(&self) -> bool {
        self.role() == Role::Candidate
    }

    pub fn is_follower(&self) -> bool {
        self.role() == Role::Follower
    }

    /// Follow `term`. A strictly greater term is adopted and clears the vote;
    /// an equal term keeps the vote already cast in it. Terms never go back.
    pub fn become_follower(&self, term: u64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if term > inner.current_term {
            self.store.write(term, None)?;
            info!(
                node = self.node_id,
                from = inner.current_term,
                to = term,
                "observed higher term, following"
            );
            inner.current_term = term;
            inner.voted_for = None;
        } else if inner.role != Role::Follower {
            info!(node = self.node_id, term = inner.current_term, role = ?inner.role, "stepping down to follower");
        }
        inner.role = Role::Follower;
        Ok(())
    }

    /// Start a candidacy: next term, vote for self. Returns the new term.
    pub fn become_candidate(&self) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock();
        let term = inner.current_term + 1;
        self.store.write(term, Some(self.node_id))?;
        inner.current_term = term;
        inner.voted_for = Some(self.node_id);
        inner.role = Role::Candidate;
        info!(node = self.node_id, term, "became candidate");
        Ok(term)
    }

    /// Take leadership of `term`. Fails if the candidacy for `term` was
    /// overtaken in the meantime (stepped down or moved to a newer term).
    pub fn become_leader(&self, term: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.role != Role::Candidate || inner.current_term != term {
            return false;
        }
        inner.role = Role::Leader;
        info!(node = self.node_id, term, "became leader");
        true
    }

    /// Give up a lost candidacy for `term` without changing the term.
    pub fn abandon_candidacy(&self, term: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.role != Role::Candidate || inner.current_term != term {
            return false;
        }
        inner.role = Role::Follower;
        debug!(node = self.node_id, term, "candidacy abandoned");
        true
    }

    /// The vote-grant gate: at most one candidate per term.
    ///
    /// A stale `term` is refused. A newer `term` first demotes this node to a
    /// follower of that term, clearing any earlier vote.
    pub fn grant_vote(&self, term: u64, candidate_id: NodeId) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        if term < inner.current_term {
            return Ok(false);
        }

        if term > inner.current_term {
            self.store.write(term, None)?;
            inner.current_term = term;
            inner.voted_for = None;
            inner.role = Role::Follower;
        }

        match inner.voted_for {
            Some(existing) if existing != candidate_id => Ok(false),
            Some(_) => Ok(true),
            None => {
                self.store.write(term, Some(candidate_id))?;
                inner.voted_for = Some(candidate_id);
                debug!(node = self.node_id, term, candidate = candidate_id, "vote granted");
                Ok(true)
            }
        }
    }
}
