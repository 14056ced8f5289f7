//! # Proxy Node
//!
//! Local stand-in for a gossip node that lives on a peer process. A proxy
//! occupies a slot in the node registry like any neighbor; forwarding to
//! it serializes the message and enqueues it on the socket owner for the
//! remote endpoint.
//!
//! The proxy holds no reference to the owner itself. It resolves the
//! connection registry on every send, so a torn-down owner surfaces as an
//! error on the next forward instead of as a dangling back-reference that
//! teardown would have to chase.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::message::{Envelope, Message};
use crate::net::{ConnectionRegistry, NetError};
use crate::registry::NodeUid;

/// Forwarding failures. Either way the proxy is non-forwarding until a
/// fresh connection is established for its endpoint.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No live connection is registered for the remote endpoint.
    #[error("no live connection to {0}")]
    Unreachable(SocketAddr),
    /// The owner terminated between lookup and enqueue.
    #[error("connection to {0} is closed")]
    Closed(SocketAddr),
}

/// Stand-in for a remote gossip node.
///
/// Equality is over the remote identity `(address, uid)`; the local-side
/// UID is just this proxy's slot in the registry.
#[derive(Debug)]
pub struct ProxyNode {
    uid: NodeUid,
    remote_uid: NodeUid,
    remote_addr: SocketAddr,
    connections: Arc<ConnectionRegistry>,
}

impl ProxyNode {
    pub fn new(
        uid: NodeUid,
        remote_uid: NodeUid,
        remote_addr: SocketAddr,
        connections: Arc<ConnectionRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            uid,
            remote_uid,
            remote_addr,
            connections,
        })
    }

    /// This proxy's local-side UID (its neighbor-set identity).
    pub fn uid(&self) -> NodeUid {
        self.uid
    }

    /// The UID of the remote node this proxy stands for. UID 0 addresses
    /// all nodes on the peer process.
    pub fn remote_uid(&self) -> NodeUid {
        self.remote_uid
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Serializes `(remote_uid, message)` and enqueues it on the endpoint's
    /// socket owner.
    pub fn forward(&self, message: &Message) -> Result<(), ProxyError> {
        let owner = self
            .connections
            .lookup(self.remote_addr)
            .ok_or(ProxyError::Unreachable(self.remote_addr))?;
        trace!(proxy = %self.uid, remote = %self.remote_uid, peer = %self.remote_addr, "forwarding over the wire");
        owner
            .send(Envelope {
                destination: self.remote_uid,
                message: message.clone(),
            })
            .map_err(|e| match e {
                NetError::Closed => ProxyError::Closed(self.remote_addr),
                _ => ProxyError::Unreachable(self.remote_addr),
            })
    }
}

impl PartialEq for ProxyNode {
    fn eq(&self, other: &Self) -> bool {
        self.remote_addr == other.remote_addr && self.remote_uid == other.remote_uid
    }
}

impl Eq for ProxyNode {}
