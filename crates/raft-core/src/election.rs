//! # election
//!
//! why: elect a leader when the current one goes quiet
//! relations: drives state.rs transitions, hands a won term to replication.rs, reads log position via LogProvider
//! what: randomized election timer thread, run_election vote fan-out and tally

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{after, bounded, never, select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::error::RaftError;
use crate::log::LogProvider;
use crate::message::VoteRequest;
use crate::replication::ReplicationManager;
use crate::state::StateManager;
use crate::transport::RaftTransport;
use crate::NodeId;

enum TimerCommand {
    Reset,
    Cancel,
}

pub struct ElectionManager {
    node_id: NodeId,
    config: Arc<ClusterConfig>,
    state: Arc<StateManager>,
    replication: Arc<ReplicationManager>,
    log: Arc<dyn LogProvider>,
    transport: Arc<dyn RaftTransport>,
    timer_tx: Sender<TimerCommand>,
    timer_rx: Receiver<TimerCommand>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
    /// held for the duration of one election
    in_progress: Mutex<()>,
}

impl ElectionManager {
    pub fn new(
        config: Arc<ClusterConfig>,
        state: Arc<StateManager>,
        replication: Arc<ReplicationManager>,
        log: Arc<dyn LogProvider>,
        transport: Arc<dyn RaftTransport>,
    ) -> Self {
        let (timer_tx, timer_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Self {
            node_id: config.node_id,
            config,
            state,
            replication,
            log,
            transport,
            timer_tx,
            timer_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            timer_thread: Mutex::new(None),
            in_progress: Mutex::new(()),
        }
    }

    pub fn start(self: &Arc<Self>) -> Result<(), RaftError> {
        let this = self.clone();
        let name = format!("raft-{}-election", self.node_id);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || this.run_timer())
            .map_err(|source| RaftError::Spawn { name, source })?;
        *self.timer_thread.lock() = Some(handle);
        Ok(())
    }

    /// Re-arm the timer with a fresh random timeout, dropping any pending one.
    pub fn reset_election_timeout(&self) {
        let _ = self.timer_tx.send(TimerCommand::Reset);
    }

    pub fn cancel_election_timeout(&self) {
        let _ = self.timer_tx.send(TimerCommand::Cancel);
    }

    pub fn shutdown(&self) {
        self.cancel_election_timeout();
        self.shutdown_tx.lock().take();
        if let Some(handle) = self.timer_thread.lock().take() {
            if handle.join().is_err() {
                error!(node = self.node_id, "election timer panicked");
            }
        }
    }

    fn random_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.config.raft.election_timeout_range());
        Duration::from_millis(ms)
    }

    fn run_timer(&self) {
        let mut deadline: Option<Instant> = None;
        loop {
            let fire = match deadline {
                Some(at) => after(at.saturating_duration_since(Instant::now())),
                None => never(),
            };
            select! {
                recv(self.timer_rx) -> command => match command {
                    Ok(TimerCommand::Reset) => deadline = Some(Instant::now() + self.random_timeout()),
                    Ok(TimerCommand::Cancel) => deadline = None,
                    Err(_) => break,
                },
                recv(self.shutdown_rx) -> _ => break,
                recv(fire) -> _ => {
                    deadline = None;
                    if self.state.is_leader() {
                        // stays armed so a later step-down is noticed
                        deadline = Some(Instant::now() + self.random_timeout());
                    } else {
                        debug!(node = self.node_id, "election timeout elapsed");
                        self.run_election();
                    }
                },
            }
        }
        debug!(node = self.node_id, "election timer stopped");
    }

    /// Stand for election in a new term. Returns whether this node won.
    ///
    /// Returns `false` right away if another election is already running on
    /// this node.
    pub fn run_election(&self) -> bool {
        let Some(_running) = self.in_progress.try_lock() else {
            return false;
        };

        let term = match self.state.become_candidate() {
            Ok(term) => term,
            Err(err) => {
                error!(node = self.node_id, %err, "failed to persist candidacy");
                self.reset_election_timeout();
                return false;
            }
        };

        let request = VoteRequest {
            term,
            candidate_id: self.node_id,
            last_log_index: self.log.log_size().saturating_sub(1),
            last_log_term: self.log.last_log_term(),
        };
        let peers: Vec<NodeId> = self.config.peers().collect();
        let majority = self.config.majority();
        info!(node = self.node_id, term, peers = peers.len(), "starting election");

        let (tx, rx) = unbounded();
        for &peer in &peers {
            let tx = tx.clone();
            let transport = self.transport.clone();
            let request = request.clone();
            let timeout = self.config.raft.vote_rpc_timeout();
            let spawned = thread::Builder::new()
                .name(format!("raft-{}-vote-{}", self.node_id, peer))
                .spawn(move || {
                    let _ = tx.send((peer, transport.request_vote(peer, request, timeout)));
                });
            if let Err(err) = spawned {
                warn!(node = self.node_id, peer, %err, "could not spawn vote request");
            }
        }
        drop(tx);

        let deadline = Instant::now() + self.config.raft.vote_collection_timeout();
        let mut votes = 1;
        let mut replies = 0;
        while votes < majority && replies < peers.len() {
            let Ok((peer, result)) = rx.recv_deadline(deadline) else {
                break;
            };
            replies += 1;
            match result {
                Ok(response) if response.vote_granted && response.term == term => {
                    votes += 1;
                    debug!(node = self.node_id, peer, term, votes, "vote granted");
                }
                Ok(response) if response.term > self.state.current_term() => {
                    info!(
                        node = self.node_id,
                        peer,
                        term = response.term,
                        "voter has a higher term, abandoning election"
                    );
                    self.replication.step_down(response.term);
                    break;
                }
                Ok(_) => debug!(node = self.node_id, peer, term, "vote denied"),
                Err(err) => debug!(node = self.node_id, peer, %err, "vote request failed"),
            }
        }

        if votes >= majority && self.state.become_leader(term) {
            info!(node = self.node_id, term, votes, "won election");
            self.replication.initialize_indices(self.log.log_size());
            self.replication.start_heartbeats();
            self.reset_election_timeout();
            return true;
        }

        info!(node = self.node_id, term, votes, majority, "lost election");
        self.state.abandon_candidacy(term);
        self.log.clear_pending_commits();
        self.reset_election_timeout();
        false
    }
}
