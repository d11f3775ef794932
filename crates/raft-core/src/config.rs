//! # config
//!
//! why: fix cluster membership and protocol timings once, at startup
//! relations: shared as Arc<ClusterConfig> by every manager; loaded from json by embedders
//! what: ClusterConfig, RaftConfig, validation and duration helpers

use std::collections::HashSet;
use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::NodeId;

/// Protocol timings, all in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound of the randomized election timeout
    pub election_timeout_max: u64,
    /// Period of the leader's AppendEntries fan-out
    pub heartbeat_interval: u64,
    /// Deadline of a single RequestVote RPC
    pub vote_rpc_timeout: u64,
    /// How long a candidate collects votes before counting
    pub vote_collection_timeout: u64,
    /// Deadline of a single AppendEntries RPC
    pub append_rpc_timeout: u64,
    /// How long a client append waits for its entry to be applied
    pub commit_timeout: u64,
    /// A leader heartbeat younger than this is trusted as the current leader
    pub leader_fresh_window: u64,
    /// Fallback window for the best-effort leader hint
    pub peer_fresh_window: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 1000,
            election_timeout_max: 2000,
            heartbeat_interval: 150,
            vote_rpc_timeout: 2000,
            vote_collection_timeout: 3000,
            append_rpc_timeout: 1000,
            commit_timeout: 3000,
            leader_fresh_window: 2000,
            peer_fresh_window: 3000,
        }
    }
}

impl RaftConfig {
    pub fn election_timeout_range(&self) -> RangeInclusive<u64> {
        self.election_timeout_min..=self.election_timeout_max
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn vote_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_rpc_timeout)
    }

    pub fn vote_collection_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_collection_timeout)
    }

    pub fn append_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.append_rpc_timeout)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout)
    }

    pub fn leader_fresh_window(&self) -> Duration {
        Duration::from_millis(self.leader_fresh_window)
    }

    pub fn peer_fresh_window(&self) -> Duration {
        Duration::from_millis(self.peer_fresh_window)
    }
}

/// Static cluster description for one node.
///
/// Membership is fixed for the life of the process: build it, validate it,
/// wrap it in an `Arc` and hand it to the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// This node's id; must appear in `members`
    pub node_id: NodeId,
    /// Every voting member, including this node
    pub members: Vec<NodeId>,
    #[serde(default)]
    pub raft: RaftConfig,
}

impl ClusterConfig {
    pub fn new(node_id: NodeId, members: Vec<NodeId>) -> Self {
        Self {
            node_id,
            members,
            raft: RaftConfig::default(),
        }
    }

    pub fn with_raft(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }

    /// Parse and validate a json document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: ClusterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.members.is_empty() {
            return Err(ConfigError::EmptyCluster);
        }

        let mut seen = HashSet::new();
        for &member in &self.members {
            if !seen.insert(member) {
                return Err(ConfigError::DuplicateMember(member));
            }
        }

        if !seen.contains(&self.node_id) {
            return Err(ConfigError::UnknownSelf(self.node_id));
        }

        if self.raft.election_timeout_min >= self.raft.election_timeout_max {
            return Err(ConfigError::InvalidElectionWindow {
                min: self.raft.election_timeout_min,
                max: self.raft.election_timeout_max,
            });
        }

        Ok(())
    }

    /// `floor(n/2) + 1` of the full membership.
    pub fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Every member except this node, in configuration order.
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members
            .iter()
            .copied()
            .filter(move |&id| id != self.node_id)
    }

    pub fn is_member(&self, id: NodeId) -> bool {
        self.members.contains(&id)
    }
}
