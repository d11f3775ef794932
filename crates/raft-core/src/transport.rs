//! # transport
//!
//! why: keep the consensus core independent of how rpcs travel between nodes
//! relations: called by election.rs and replication.rs; RaftNode is the MessageHandler on the receiving side
//! what: RaftTransport trait, MessageHandler trait, LocalNetwork in-process transport with partitions

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::trace;

use crate::error::TransportError;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, RaftMessage, VoteRequest, VoteResponse,
};
use crate::NodeId;

/// Outbound rpc surface used by one node to reach its peers.
///
/// Calls block the issuing thread for at most `timeout`; a slow peer only
/// delays the worker talking to it.
pub trait RaftTransport: Send + Sync {
    fn request_vote(
        &self,
        target: NodeId,
        request: VoteRequest,
        timeout: Duration,
    ) -> Result<VoteResponse, TransportError>;

    fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
        timeout: Duration,
    ) -> Result<AppendEntriesResponse, TransportError>;
}

/// Inbound side: turns a request message into its reply.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, message: RaftMessage) -> Option<RaftMessage>;
}

#[derive(Default)]
struct Registry {
    handlers: HashMap<NodeId, Weak<dyn MessageHandler>>,
    isolated: HashSet<NodeId>,
}

/// In-process network connecting nodes that live in the same address space.
///
/// Requests are delivered synchronously on the caller's thread. Isolating a
/// node drops every message to or from it until it is healed.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    registry: Arc<RwLock<Registry>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: MessageHandler + 'static>(&self, id: NodeId, handler: &Arc<H>) {
        let weak: Weak<H> = Arc::downgrade(handler);
        let handler: Weak<dyn MessageHandler> = weak;
        self.registry.write().handlers.insert(id, handler);
    }

    /// Forget a node, as if its process had died.
    pub fn unregister(&self, id: NodeId) {
        self.registry.write().handlers.remove(&id);
    }

    pub fn isolate(&self, id: NodeId) {
        self.registry.write().isolated.insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        self.registry.write().isolated.remove(&id);
    }

    pub fn is_isolated(&self, id: NodeId) -> bool {
        self.registry.read().isolated.contains(&id)
    }

    /// The transport a node with id `from` should use.
    pub fn transport(&self, from: NodeId) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            from,
            network: self.clone(),
        })
    }

    fn deliver(
        &self,
        from: NodeId,
        to: NodeId,
        message: RaftMessage,
        timeout: Duration,
    ) -> Result<RaftMessage, TransportError> {
        let handler = {
            let registry = self.registry.read();
            if registry.isolated.contains(&from) || registry.isolated.contains(&to) {
                return Err(TransportError::Unreachable(to));
            }
            registry
                .handlers
                .get(&to)
                .and_then(Weak::upgrade)
                .ok_or(TransportError::Unreachable(to))?
        };

        trace!(from, to, ?message, "delivering");
        let started = Instant::now();
        let reply = handler
            .handle_message(message)
            .ok_or(TransportError::UnexpectedResponse)?;

        // replies that miss the deadline are dropped like a late network reply
        if started.elapsed() > timeout {
            return Err(TransportError::Timeout(to));
        }
        Ok(reply)
    }
}

/// One node's handle on a [`LocalNetwork`].
pub struct LocalTransport {
    from: NodeId,
    network: LocalNetwork,
}

impl RaftTransport for LocalTransport {
    fn request_vote(
        &self,
        target: NodeId,
        request: VoteRequest,
        timeout: Duration,
    ) -> Result<VoteResponse, TransportError> {
        match self
            .network
            .deliver(self.from, target, request.into(), timeout)?
        {
            RaftMessage::VoteResponse(response) => Ok(response),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }

    fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
        timeout: Duration,
    ) -> Result<AppendEntriesResponse, TransportError> {
        match self
            .network
            .deliver(self.from, target, request.into(), timeout)?
        {
            RaftMessage::AppendEntriesResponse(response) => Ok(response),
            _ => Err(TransportError::UnexpectedResponse),
        }
    }
}
