//! # replication
//!
//! why: keep every follower's log converging on the leader's and track who has what
//! relations: reads the log through log::LogProvider, sends through transport::RaftTransport, demotes via state.rs
//! what: per-peer progress, heartbeat ticker, per-peer replication workers, step-down, leader hint

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::error::RaftError;
use crate::log::{LogEntry, LogProvider};
use crate::message::AppendEntriesRequest;
use crate::state::StateManager;
use crate::transport::RaftTransport;
use crate::NodeId;

/// Leader's view of one member's log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PeerProgress {
    /// Next index to send
    pub next_index: u64,
    /// Highest index known to be replicated
    pub match_index: u64,
}

/// Per-peer row of the node status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStats {
    pub node_id: NodeId,
    pub next_index: u64,
    pub match_index: u64,
    pub last_heartbeat_ms_ago: Option<u64>,
}

#[derive(Debug, Default)]
struct Liveness {
    /// Last leader that sent us AppendEntries in our current term
    leader: Option<(NodeId, Instant)>,
    /// Last successful contact per peer
    peers: HashMap<NodeId, Instant>,
}

/// Leader-side replication plus the follower-side leader hint.
///
/// One worker thread per peer owns all traffic to that peer; triggers
/// coalesce in a single-slot channel so a busy worker is never queued more
/// than one round behind.
pub struct ReplicationManager {
    node_id: NodeId,
    config: Arc<ClusterConfig>,
    state: Arc<StateManager>,
    transport: Arc<dyn RaftTransport>,
    log: OnceLock<Weak<dyn LogProvider>>,
    progress: Mutex<HashMap<NodeId, PeerProgress>>,
    liveness: Mutex<Liveness>,
    heartbeats: AtomicBool,
    triggers: HashMap<NodeId, Sender<()>>,
    idle_workers: Mutex<Vec<(NodeId, Receiver<()>)>>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationManager {
    pub fn new(
        config: Arc<ClusterConfig>,
        state: Arc<StateManager>,
        transport: Arc<dyn RaftTransport>,
    ) -> Self {
        let mut triggers = HashMap::new();
        let mut idle_workers = Vec::new();
        for peer in config.peers() {
            let (tx, rx) = bounded(1);
            triggers.insert(peer, tx);
            idle_workers.push((peer, rx));
        }
        let (shutdown_tx, shutdown_rx) = bounded(0);

        Self {
            node_id: config.node_id,
            config,
            state,
            transport,
            log: OnceLock::new(),
            progress: Mutex::new(HashMap::new()),
            liveness: Mutex::new(Liveness::default()),
            heartbeats: AtomicBool::new(false),
            triggers,
            idle_workers: Mutex::new(idle_workers),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Wire in the log once it exists. Later calls are ignored.
    pub fn attach_log(&self, log: Weak<dyn LogProvider>) {
        if self.log.set(log).is_err() {
            warn!(node = self.node_id, "log already attached");
        }
    }

    fn log(&self) -> Option<Arc<dyn LogProvider>> {
        self.log.get().and_then(Weak::upgrade)
    }

    // -- lifecycle --

    /// Spawn the heartbeat ticker and one worker per peer.
    pub fn start(self: &Arc<Self>) -> Result<(), RaftError> {
        let workers: Vec<_> = self.idle_workers.lock().drain(..).collect();
        let mut threads = self.threads.lock();

        for (peer, work) in workers {
            let this = self.clone();
            let name = format!("raft-{}-replicate-{}", self.node_id, peer);
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || this.run_peer_worker(peer, work))
                .map_err(|source| RaftError::Spawn { name, source })?;
            threads.push(handle);
        }

        let this = self.clone();
        let name = format!("raft-{}-heartbeat", self.node_id);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || this.run_heartbeat_ticker())
            .map_err(|source| RaftError::Spawn { name, source })?;
        threads.push(handle);

        Ok(())
    }

    /// Stop all replication threads and wait for them.
    pub fn shutdown(&self) {
        self.heartbeats.store(false, Ordering::SeqCst);
        self.shutdown_tx.lock().take();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!(node = self.node_id, "replication thread panicked");
            }
        }
    }

    fn run_peer_worker(&self, peer: NodeId, work: Receiver<()>) {
        loop {
            select! {
                recv(work) -> msg => match msg {
                    Ok(()) => self.replicate_to_peer(peer),
                    Err(_) => break,
                },
                recv(self.shutdown_rx) -> _ => break,
            }
        }
        debug!(node = self.node_id, peer, "replication worker stopped");
    }

    fn run_heartbeat_ticker(&self) {
        let ticker = tick(self.config.raft.heartbeat_interval());
        loop {
            select! {
                recv(ticker) -> _ => {
                    if self.heartbeats.load(Ordering::SeqCst) && self.state.is_leader() {
                        self.trigger_replication();
                    }
                },
                recv(self.shutdown_rx) -> _ => break,
            }
        }
        debug!(node = self.node_id, "heartbeat ticker stopped");
    }

    // -- leadership --

    /// Reset progress for a fresh term: every next index to `log_size`,
    /// every match index to 0, own match index to the last local entry.
    pub fn initialize_indices(&self, log_size: u64) {
        let mut progress = self.progress.lock();
        progress.clear();
        for peer in self.config.peers() {
            progress.insert(
                peer,
                PeerProgress {
                    next_index: log_size,
                    match_index: 0,
                },
            );
        }
        progress.insert(
            self.node_id,
            PeerProgress {
                next_index: log_size,
                match_index: log_size.saturating_sub(1),
            },
        );
    }

    /// Begin periodic replication and send a first round right away.
    pub fn start_heartbeats(&self) {
        self.heartbeats.store(true, Ordering::SeqCst);
        self.trigger_replication();
    }

    pub fn stop_heartbeats(&self) {
        self.heartbeats.store(false, Ordering::SeqCst);
    }

    pub fn heartbeats_active(&self) -> bool {
        self.heartbeats.load(Ordering::SeqCst)
    }

    /// Wake every peer worker. Workers that already have a round queued
    /// are skipped.
    pub fn trigger_replication(&self) {
        for trigger in self.triggers.values() {
            let _ = trigger.try_send(());
        }
    }

    /// Adopt `term` as a follower and drop everything that only makes
    /// sense for a leader.
    pub fn step_down(&self, term: u64) {
        if let Err(err) = self.state.become_follower(term) {
            error!(node = self.node_id, term, %err, "failed to persist term while stepping down");
        }
        self.stop_heartbeats();
        self.liveness.lock().leader = None;
        if let Some(log) = self.log() {
            log.clear_pending_commits();
        }
    }

    /// The leader's own append counts toward its replica tally.
    pub fn record_self_append(&self, index: u64) {
        let mut progress = self.progress.lock();
        let own = progress.entry(self.node_id).or_default();
        own.match_index = own.match_index.max(index);
        own.next_index = own.match_index + 1;
    }

    /// One AppendEntries round to `peer`: send everything from its next
    /// index onward and fold the answer into its progress.
    pub fn replicate_to_peer(&self, peer: NodeId) {
        if peer == self.node_id {
            return;
        }
        let Some(term) = self.state.leader_term() else {
            return;
        };
        let Some(log) = self.log() else {
            return;
        };

        let log_size = log.log_size();
        let next_index = self
            .progress
            .lock()
            .get(&peer)
            .map(|p| p.next_index)
            .unwrap_or(log_size)
            .clamp(1, log_size);
        let prev_log_index = next_index - 1;
        let prev_log_term = log.entry(prev_log_index).map(|e| e.term).unwrap_or(0);
        let entries: Vec<LogEntry> = (next_index..log_size).map_while(|i| log.entry(i)).collect();

        let request = AppendEntriesRequest {
            leader_id: self.node_id,
            term,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: log.commit_index(),
        };
        let sent_through = request.last_index();
        let sent = request.entries.len();

        let response = match self.transport.append_entries(
            peer,
            request,
            self.config.raft.append_rpc_timeout(),
        ) {
            Ok(response) => response,
            Err(err) => {
                debug!(node = self.node_id, peer, %err, "append entries failed");
                return;
            }
        };

        if response.term > self.state.current_term() {
            info!(
                node = self.node_id,
                peer,
                term = response.term,
                "peer has a higher term, stepping down"
            );
            self.step_down(response.term);
            return;
        }
        // the term moved on while the rpc was in flight
        if self.state.leader_term() != Some(term) {
            return;
        }

        if response.success {
            self.record_success(peer, sent_through);
            if sent > 0 {
                debug!(node = self.node_id, peer, match_index = sent_through, "replicated");
            }
            log.try_commit();
        } else {
            let next_index = self.record_rejection(peer);
            debug!(node = self.node_id, peer, next_index, "append rejected, backing off");
        }
    }

    fn record_success(&self, peer: NodeId, matched: u64) {
        {
            let mut progress = self.progress.lock();
            let entry = progress.entry(peer).or_default();
            entry.match_index = entry.match_index.max(matched);
            entry.next_index = entry.match_index + 1;
        }
        self.record_heartbeat(peer);
    }

    fn record_rejection(&self, peer: NodeId) -> u64 {
        let mut progress = self.progress.lock();
        let entry = progress.entry(peer).or_default();
        entry.next_index = entry.next_index.saturating_sub(1).max(1);
        entry.next_index
    }

    // -- progress queries --

    pub fn majority(&self) -> usize {
        self.config.majority()
    }

    pub fn progress(&self, node: NodeId) -> Option<PeerProgress> {
        self.progress.lock().get(&node).copied()
    }

    pub fn next_index(&self, node: NodeId) -> u64 {
        self.progress(node).map(|p| p.next_index).unwrap_or(0)
    }

    pub fn match_index(&self, node: NodeId) -> u64 {
        self.progress(node).map(|p| p.match_index).unwrap_or(0)
    }

    /// Members, self included, whose match index is at least `index`.
    pub fn count_replicas_with_index(&self, index: u64) -> usize {
        let progress = self.progress.lock();
        self.config
            .members
            .iter()
            .filter(|id| progress.get(id).is_some_and(|p| p.match_index >= index))
            .count()
    }

    // -- liveness / leader hint --

    pub fn record_heartbeat(&self, peer: NodeId) {
        self.liveness.lock().peers.insert(peer, Instant::now());
    }

    /// Follower side: `leader` just sent us AppendEntries in our term.
    pub fn record_leader_heartbeat(&self, leader: NodeId) {
        let now = Instant::now();
        let mut liveness = self.liveness.lock();
        liveness.leader = Some((leader, now));
        liveness.peers.insert(leader, now);
    }

    pub fn last_heartbeat(&self, peer: NodeId) -> Option<Instant> {
        self.liveness.lock().peers.get(&peer).copied()
    }

    /// Best guess at the current leader for client redirects.
    ///
    /// Self when leading; otherwise the leader heard from recently, falling
    /// back to the most recently heard peer within a wider window.
    pub fn likely_leader(&self) -> Option<NodeId> {
        if self.state.is_leader() {
            return Some(self.node_id);
        }

        let liveness = self.liveness.lock();
        if let Some((leader, at)) = liveness.leader {
            if at.elapsed() <= self.config.raft.leader_fresh_window() {
                return Some(leader);
            }
        }

        let window = self.config.raft.peer_fresh_window();
        liveness
            .peers
            .iter()
            .filter(|(_, at)| at.elapsed() <= window)
            .max_by_key(|(_, at)| **at)
            .map(|(&id, _)| id)
    }

    pub fn peer_stats(&self) -> Vec<PeerStats> {
        let progress = self.progress.lock();
        let liveness = self.liveness.lock();
        self.config
            .peers()
            .map(|peer| {
                let p = progress.get(&peer).copied().unwrap_or_default();
                PeerStats {
                    node_id: peer,
                    next_index: p.next_index,
                    match_index: p.match_index,
                    last_heartbeat_ms_ago: liveness
                        .peers
                        .get(&peer)
                        .map(|at| at.elapsed().as_millis() as u64),
                }
            })
            .collect()
    }
}
