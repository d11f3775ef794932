//! # comprehensive raft tests
//!
//! why: verify all raft consensus scenarios work correctly
//! relations: tests raft-core through RaftNode over the in-process LocalNetwork
//! what: initialization, quorum, rpc handling, election, replication, partition, redirect scenarios

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use raft_core::{
    AppendEntriesRequest, ClusterConfig, KvStore, LocalNetwork, LogEntry, MemLogStore,
    MemVoteStore, NodeId, RaftConfig, RaftError, RaftNode, Role, VoteRequest,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// timings short enough for tests but with a wide election window
fn fast_config() -> RaftConfig {
    RaftConfig {
        election_timeout_min: 150,
        election_timeout_max: 300,
        heartbeat_interval: 30,
        vote_rpc_timeout: 100,
        vote_collection_timeout: 200,
        append_rpc_timeout: 100,
        commit_timeout: 1000,
        leader_fresh_window: 300,
        peer_fresh_window: 500,
    }
}

/// a node that is built but never started
fn idle_node(id: NodeId, members: Vec<NodeId>) -> Arc<RaftNode> {
    RaftNode::new(
        ClusterConfig::new(id, members),
        Box::new(MemLogStore::new()),
        Box::new(MemVoteStore::new()),
        LocalNetwork::new().transport(id),
        Box::new(KvStore::new()),
    )
    .unwrap()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

struct TestCluster {
    network: LocalNetwork,
    nodes: HashMap<NodeId, Arc<RaftNode>>,
    kv: HashMap<NodeId, KvStore>,
}

impl TestCluster {
    fn new(size: u64) -> Self {
        init_tracing();
        let network = LocalNetwork::new();
        let members: Vec<NodeId> = (1..=size).collect();
        let mut nodes = HashMap::new();
        let mut kv = HashMap::new();

        for &id in &members {
            let store = KvStore::new();
            let node = RaftNode::new(
                ClusterConfig::new(id, members.clone()).with_raft(fast_config()),
                Box::new(MemLogStore::new()),
                Box::new(MemVoteStore::new()),
                network.transport(id),
                Box::new(store.clone()),
            )
            .unwrap();
            network.register(id, &node);
            nodes.insert(id, node);
            kv.insert(id, store);
        }
        for node in nodes.values() {
            node.start().unwrap();
        }

        Self { network, nodes, kv }
    }

    fn node(&self, id: NodeId) -> &Arc<RaftNode> {
        &self.nodes[&id]
    }

    /// the single leader among reachable nodes, once one is stable
    fn wait_for_leader(&self) -> NodeId {
        let mut found = None;
        let settled = wait_until(Duration::from_secs(10), || {
            let leaders: Vec<NodeId> = self
                .nodes
                .values()
                .filter(|n| n.is_leader() && !self.network.is_isolated(n.id()))
                .map(|n| n.id())
                .collect();
            found = (leaders.len() == 1).then(|| leaders[0]);
            found.is_some()
        });
        assert!(settled, "no leader elected");
        found.unwrap()
    }

    fn followers_of(&self, leader: NodeId) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().filter(|&id| id != leader).collect();
        ids.sort_unstable();
        ids
    }

    fn all_applied(&self, index: u64) -> bool {
        self.nodes.values().all(|n| n.last_applied() >= index)
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for node in self.nodes.values() {
            node.shutdown();
        }
    }
}

// =============================================================================
// SECTION 1: INITIALIZATION TESTS
// =============================================================================

mod initialization {
    use super::*;

    #[test]
    fn new_node_starts_as_follower() {
        let node = idle_node(1, vec![1, 2, 3]);
        assert_eq!(node.role(), Role::Follower);
        assert_eq!(node.current_term(), 0);
        assert_eq!(node.voted_for(), None);
        assert!(node.entries().is_empty());
        assert_eq!(node.commit_index(), 0);
        assert_eq!(node.last_applied(), 0);
    }

    #[test]
    fn node_knows_cluster_membership() {
        let node = idle_node(1, vec![1, 2, 3]);
        assert_eq!(node.config().members, vec![1, 2, 3]);
        assert_eq!(node.id(), 1);
    }

    #[test]
    fn default_config_values() {
        let config = RaftConfig::default();
        assert_eq!(config.election_timeout_min, 1000);
        assert_eq!(config.election_timeout_max, 2000);
        assert_eq!(config.heartbeat_interval, 150);
        assert_eq!(config.commit_timeout, 3000);
    }

    #[test]
    fn config_loads_from_json() {
        let config = ClusterConfig::from_json_str(
            r#"{"node_id": 2, "members": [1, 2, 3], "raft": {"heartbeat_interval": 50}}"#,
        )
        .unwrap();
        assert_eq!(config.node_id, 2);
        assert_eq!(config.raft.heartbeat_interval, 50);
        assert_eq!(config.raft.election_timeout_min, 1000);
    }

    #[test]
    fn restarted_node_recovers_its_log() {
        let log = MemLogStore::with_entries(vec![
            LogEntry::new(1, 1, b"SET a 1".to_vec()),
            LogEntry::new(2, 2, b"SET b 2".to_vec()),
        ]);
        let node = RaftNode::new(
            ClusterConfig::new(1, vec![1, 2, 3]),
            Box::new(log),
            Box::new(MemVoteStore::new()),
            LocalNetwork::new().transport(1),
            Box::new(KvStore::new()),
        )
        .unwrap();

        assert_eq!(node.last_log_index(), 2);
        // committed state is relearned from the leader, not the log
        assert_eq!(node.commit_index(), 0);
    }
}

// =============================================================================
// SECTION 2: QUORUM CALCULATION TESTS
// =============================================================================

mod quorum {
    use super::*;

    #[test]
    fn majority_of_odd_clusters() {
        assert_eq!(ClusterConfig::new(1, vec![1]).majority(), 1);
        assert_eq!(ClusterConfig::new(1, vec![1, 2, 3]).majority(), 2);
        assert_eq!(ClusterConfig::new(1, vec![1, 2, 3, 4, 5]).majority(), 3);
    }

    #[test]
    fn majority_of_even_clusters() {
        assert_eq!(ClusterConfig::new(1, vec![1, 2]).majority(), 2);
        assert_eq!(ClusterConfig::new(1, vec![1, 2, 3, 4]).majority(), 3);
    }

    #[test]
    fn peers_exclude_self() {
        let config = ClusterConfig::new(2, vec![1, 2, 3]);
        assert_eq!(config.peers().collect::<Vec<_>>(), vec![1, 3]);
    }
}

// =============================================================================
// SECTION 3: VOTE REQUEST HANDLING TESTS
// =============================================================================

mod vote_requests {
    use super::*;

    fn request(term: u64, candidate_id: NodeId) -> VoteRequest {
        VoteRequest {
            term,
            candidate_id,
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    #[test]
    fn grants_first_request_in_term() {
        let node = idle_node(1, vec![1, 2, 3]);
        let response = node.handle_request_vote(request(1, 2));
        assert!(response.vote_granted);
        assert_eq!(response.term, 1);
    }

    #[test]
    fn refuses_second_candidate_in_same_term() {
        let node = idle_node(1, vec![1, 2, 3]);
        assert!(node.handle_request_vote(request(1, 2)).vote_granted);
        assert!(!node.handle_request_vote(request(1, 3)).vote_granted);
        assert!(node.handle_request_vote(request(1, 2)).vote_granted);
    }

    #[test]
    fn refuses_stale_term() {
        let node = idle_node(1, vec![1, 2, 3]);
        node.handle_request_vote(request(5, 2));

        let response = node.handle_request_vote(request(4, 3));

        assert!(!response.vote_granted);
        assert_eq!(response.term, 5);
    }

    #[test]
    fn newer_term_allows_a_new_vote() {
        let node = idle_node(1, vec![1, 2, 3]);
        node.handle_request_vote(request(1, 2));

        assert!(node.handle_request_vote(request(2, 3)).vote_granted);
        assert_eq!(node.voted_for(), Some(3));
    }

    #[test]
    fn candidate_with_shorter_log_is_refused() {
        let node = idle_node(1, vec![1, 2, 3]);
        node.handle_append_entries(AppendEntriesRequest {
            leader_id: 2,
            term: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![LogEntry::new(1, 1, b"SET a 1".to_vec())],
            leader_commit: 0,
        });

        let response = node.handle_request_vote(VoteRequest {
            term: 2,
            candidate_id: 3,
            last_log_index: 0,
            last_log_term: 0,
        });

        assert!(!response.vote_granted);
        assert_eq!(node.current_term(), 2);
    }
}

// =============================================================================
// SECTION 4: APPEND ENTRIES HANDLING TESTS
// =============================================================================

mod append_entries {
    use super::*;

    fn heartbeat(term: u64, prev: (u64, u64), commit: u64) -> AppendEntriesRequest {
        AppendEntriesRequest {
            leader_id: 2,
            term,
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries: vec![],
            leader_commit: commit,
        }
    }

    fn with_entries(term: u64, prev: (u64, u64), entries: Vec<LogEntry>, commit: u64) -> AppendEntriesRequest {
        AppendEntriesRequest {
            entries,
            ..heartbeat(term, prev, commit)
        }
    }

    #[test]
    fn heartbeat_adopts_leader_term() {
        let node = idle_node(1, vec![1, 2, 3]);
        let response = node.handle_append_entries(heartbeat(3, (0, 0), 0));
        assert!(response.success);
        assert_eq!(node.current_term(), 3);
        assert_eq!(node.role(), Role::Follower);
    }

    #[test]
    fn heartbeat_after_lost_election_keeps_self_vote() {
        let node = idle_node(1, vec![1, 2, 3]);
        assert!(!node.campaign());
        assert_eq!(node.current_term(), 1);

        node.handle_append_entries(heartbeat(1, (0, 0), 0));

        assert_eq!(node.role(), Role::Follower);
        assert_eq!(node.voted_for(), Some(1));
    }

    #[test]
    fn missing_prev_entry_is_rejected() {
        let node = idle_node(1, vec![1, 2, 3]);
        let response = node.handle_append_entries(heartbeat(1, (4, 1), 0));
        assert!(!response.success);
        assert_eq!(response.term, 1);
    }

    #[test]
    fn conflicting_suffix_is_replaced() {
        let node = idle_node(1, vec![1, 2, 3]);
        node.handle_append_entries(with_entries(
            1,
            (0, 0),
            vec![
                LogEntry::new(1, 1, b"SET a 1".to_vec()),
                LogEntry::new(1, 2, b"SET b 1".to_vec()),
                LogEntry::new(1, 3, b"SET c 1".to_vec()),
            ],
            1,
        ));

        let response = node.handle_append_entries(with_entries(
            2,
            (1, 1),
            vec![LogEntry::new(2, 2, b"SET b 2".to_vec())],
            1,
        ));

        assert!(response.success);
        let terms: Vec<u64> = node.entries().iter().map(|e| e.term).collect();
        assert_eq!(terms, vec![1, 2]);
    }

    #[test]
    fn commit_is_bounded_by_local_log() {
        let node = idle_node(1, vec![1, 2, 3]);
        node.handle_append_entries(with_entries(
            1,
            (0, 0),
            vec![LogEntry::new(1, 1, b"SET a 1".to_vec())],
            7,
        ));
        assert_eq!(node.commit_index(), 1);
        assert_eq!(node.last_applied(), 1);
    }
}

// =============================================================================
// SECTION 5: CLUSTER ELECTION TESTS
// =============================================================================

mod cluster_election {
    use super::*;

    #[test]
    fn elects_exactly_one_leader() {
        let cluster = TestCluster::new(3);
        let leader = cluster.wait_for_leader();
        let term = cluster.node(leader).current_term();

        let leaders_in_term = cluster
            .nodes
            .values()
            .filter(|n| n.is_leader() && n.current_term() == term)
            .count();
        assert_eq!(leaders_in_term, 1);
    }

    #[test]
    fn followers_learn_the_leader() {
        let cluster = TestCluster::new(3);
        let leader = cluster.wait_for_leader();

        assert!(wait_until(Duration::from_secs(5), || {
            cluster
                .followers_of(leader)
                .iter()
                .all(|&id| cluster.node(id).likely_leader() == Some(leader))
        }));
        assert_eq!(cluster.node(leader).likely_leader(), Some(leader));
    }

    #[test]
    fn isolated_leader_is_replaced() {
        let cluster = TestCluster::new(3);
        let old = cluster.wait_for_leader();
        let old_term = cluster.node(old).current_term();

        cluster.network.isolate(old);
        let new = cluster.wait_for_leader();

        assert_ne!(new, old);
        assert!(cluster.node(new).current_term() > old_term);
    }
}

// =============================================================================
// SECTION 6: LOG REPLICATION TESTS
// =============================================================================

mod replication {
    use super::*;

    #[test]
    fn set_command_reaches_every_node() {
        let cluster = TestCluster::new(3);
        let leader = cluster.wait_for_leader();

        let index = cluster.node(leader).append_entry("SET foo bar").unwrap();

        assert_eq!(index, 1);
        assert!(wait_until(Duration::from_secs(5), || cluster.all_applied(1)));
        for kv in cluster.kv.values() {
            assert_eq!(kv.get("foo").as_deref(), Some("bar"));
        }
    }

    #[test]
    fn indices_are_strictly_increasing() {
        let cluster = TestCluster::new(3);
        let leader = cluster.wait_for_leader();
        let node = cluster.node(leader);

        let indices: Vec<u64> = (0..5)
            .map(|i| node.append_entry(format!("SET k{i} {i}")).unwrap())
            .collect();

        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn concurrent_clients_get_distinct_indices() {
        let cluster = TestCluster::new(3);
        let leader = cluster.wait_for_leader();
        let node = cluster.node(leader).clone();

        let clients: Vec<_> = (0..4)
            .map(|c| {
                let node = node.clone();
                thread::spawn(move || {
                    (0..5)
                        .map(|i| node.append_entry(format!("SET c{c}-{i} x")).unwrap())
                        .collect::<Vec<u64>>()
                })
            })
            .collect();
        let mut indices: Vec<u64> = clients
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        indices.sort_unstable();

        assert_eq!(indices, (1..=20).collect::<Vec<u64>>());
    }

    #[test]
    fn logs_converge_across_nodes() {
        let cluster = TestCluster::new(3);
        let leader = cluster.wait_for_leader();
        for i in 0..3 {
            cluster.node(leader).append_entry(format!("SET k {i}")).unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || cluster.all_applied(3)));
        let reference = cluster.node(leader).entries();
        for node in cluster.nodes.values() {
            assert_eq!(node.entries(), reference);
        }
        for kv in cluster.kv.values() {
            assert_eq!(kv.get("k").as_deref(), Some("2"));
        }
    }

    #[test]
    fn minority_outage_does_not_block_commits() {
        let cluster = TestCluster::new(3);
        let leader = cluster.wait_for_leader();
        let lagging = cluster.followers_of(leader)[0];

        cluster.network.isolate(lagging);
        for i in 1..=3 {
            assert_eq!(
                cluster.node(leader).append_entry(format!("SET n {i}")).unwrap(),
                i
            );
        }
        assert_eq!(cluster.node(lagging).last_log_index(), 0);

        // the other follower must know the commit point before the lagging node rejoins
        let other = cluster.followers_of(leader)[1];
        assert!(wait_until(Duration::from_secs(5), || {
            cluster.node(other).commit_index() >= 3
        }));
        cluster.network.heal(lagging);

        assert!(wait_until(Duration::from_secs(10), || cluster.all_applied(3)));
        assert_eq!(cluster.kv[&lagging].get("n").as_deref(), Some("3"));
    }
}

// =============================================================================
// SECTION 7: LEADER FAILURE AND STALE LEADERS
// =============================================================================

mod leader_failure {
    use super::*;

    #[test]
    fn stale_leader_steps_down_and_discards_uncommitted_entry() {
        let cluster = TestCluster::new(3);
        let old = cluster.wait_for_leader();
        cluster.node(old).append_entry("SET base 1").unwrap();
        assert!(wait_until(Duration::from_secs(5), || cluster.all_applied(1)));

        cluster.network.isolate(old);
        let stale = cluster.node(old).append_entry("SET stale 1");
        assert!(matches!(stale, Err(RaftError::CommitTimeout { index: 2, .. })));

        let new = cluster.wait_for_leader();
        assert_eq!(cluster.node(new).append_entry("SET fresh 1").unwrap(), 2);

        cluster.network.heal(old);
        assert!(wait_until(Duration::from_secs(10), || {
            !cluster.node(old).is_leader() && cluster.node(old).last_applied() >= 2
        }));

        let old_node = cluster.node(old);
        assert_eq!(old_node.role(), Role::Follower);
        assert!(old_node.current_term() >= cluster.node(new).current_term());
        assert_eq!(cluster.kv[&old].get("stale"), None);
        assert_eq!(cluster.kv[&old].get("fresh").as_deref(), Some("1"));
    }

    #[test]
    fn step_down_fails_waiting_client() {
        let cluster = TestCluster::new(3);
        let leader = cluster.wait_for_leader();
        let node = cluster.node(leader).clone();
        cluster.network.isolate(leader);

        let client = thread::spawn(move || node.append_entry("SET lost 1"));
        assert!(wait_until(Duration::from_secs(2), || {
            cluster.node(leader).status().pending_commits == 1
        }));
        let term = cluster.node(leader).current_term();
        cluster.node(leader).replication().step_down(term + 10);

        assert!(matches!(
            client.join().unwrap(),
            Err(RaftError::CommitAborted { index: 1 })
        ));
    }
}

// =============================================================================
// SECTION 8: CLIENT REDIRECTS AND STATUS
// =============================================================================

mod client_surface {
    use super::*;

    #[test]
    fn followers_redirect_to_the_leader() {
        let cluster = TestCluster::new(3);
        let leader = cluster.wait_for_leader();
        let follower = cluster.followers_of(leader)[0];
        assert!(wait_until(Duration::from_secs(5), || {
            cluster.node(follower).likely_leader() == Some(leader)
        }));

        let err = cluster.node(follower).append_entry("SET x 1").unwrap_err();

        assert!(matches!(err, RaftError::NotLeader { .. }));
        assert_eq!(err.leader_hint(), Some(leader));
    }

    #[test]
    fn leader_status_reports_progress() {
        let cluster = TestCluster::new(3);
        let leader = cluster.wait_for_leader();
        cluster.node(leader).append_entry("SET s 1").unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            cluster
                .node(leader)
                .peer_stats()
                .iter()
                .all(|p| p.match_index == 1)
        }));
        let status = cluster.node(leader).status();
        assert_eq!(status.role, Role::Leader);
        assert_eq!(status.leader, Some(leader));
        assert_eq!(status.commit_index, 1);
        assert_eq!(status.peers.len(), 2);

        let json: serde_json::Value = serde_json::from_str(&status.to_json().unwrap()).unwrap();
        assert_eq!(json["role"], "Leader");
    }

    #[test]
    fn recent_entries_show_the_tail() {
        let cluster = TestCluster::new(1);
        let leader = cluster.wait_for_leader();
        let node = cluster.node(leader);
        for i in 0..4 {
            node.append_entry(format!("SET r {i}")).unwrap();
        }

        let recent = node.recent_entries(2);

        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].index, 3);
        assert_eq!(recent[1].payload, b"SET r 3".to_vec());
    }
}

// =============================================================================
// SECTION 9: EDGE CASES AND INVARIANTS
// =============================================================================

mod edge_cases {
    use super::*;
    use raft_core::RaftTransport;

    #[test]
    fn single_node_cluster_elects_itself() {
        let cluster = TestCluster::new(1);
        assert_eq!(cluster.wait_for_leader(), 1);
        assert_eq!(cluster.node(1).append_entry("SET only 1").unwrap(), 1);
    }

    #[test]
    fn two_node_cluster_needs_both() {
        let cluster = TestCluster::new(2);
        let leader = cluster.wait_for_leader();
        cluster.network.isolate(cluster.followers_of(leader)[0]);

        let result = cluster.node(leader).append_entry("SET x 1");

        assert!(matches!(result, Err(RaftError::CommitTimeout { .. })));
    }

    #[test]
    fn bad_command_does_not_stall_the_log() {
        let cluster = TestCluster::new(3);
        let leader = cluster.wait_for_leader();
        let node = cluster.node(leader);

        assert_eq!(node.append_entry("NOPE").unwrap(), 1);
        assert_eq!(node.append_entry("SET after 1").unwrap(), 2);
        assert_eq!(cluster.kv[&leader].get("after").as_deref(), Some("1"));
    }

    #[test]
    fn dropping_a_started_node_stops_it() {
        let network = LocalNetwork::new();
        let node = RaftNode::new(
            ClusterConfig::new(1, vec![1]).with_raft(fast_config()),
            Box::new(MemLogStore::new()),
            Box::new(MemVoteStore::new()),
            network.transport(1),
            Box::new(KvStore::new()),
        )
        .unwrap();
        network.register(1, &node);
        node.start().unwrap();

        drop(node);

        let reply = network.transport(2).request_vote(
            1,
            VoteRequest {
                term: 1,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            },
            Duration::from_millis(100),
        );
        assert!(reply.is_err());
    }
}
