//! # Connection Registry
//!
//! Process-wide `(address, port) → SocketOwner` mapping with exactly one
//! live owner per peer endpoint. Keys are canonicalized so equivalent
//! address spellings (IPv4 and its IPv4-mapped IPv6 form) collide instead
//! of silently producing two connections to the same peer.

use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::Arc;

use crossbeam::channel::Sender;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::CONNECT_TIMEOUT;

use super::owner::{InboundFrame, SocketOwner};
use super::NetError;

type PeerKey = (IpAddr, u16);

fn canonical_key(addr: SocketAddr) -> PeerKey {
    (addr.ip().to_canonical(), addr.port())
}

/// One owner per peer endpoint, plus the dial lock that serializes racing
/// outbound establishment.
#[derive(Debug)]
pub struct ConnectionRegistry {
    owners: DashMap<PeerKey, Arc<SocketOwner>>,
    dial_lock: Mutex<()>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            owners: DashMap::new(),
            dial_lock: Mutex::new(()),
        })
    }

    /// Looks up the live owner for an endpoint.
    pub fn lookup(&self, addr: SocketAddr) -> Option<Arc<SocketOwner>> {
        self.owners.get(&canonical_key(addr)).map(|e| e.value().clone())
    }

    /// Registers an owner. Fails when a live entry already exists.
    pub fn insert(&self, addr: SocketAddr, owner: Arc<SocketOwner>) -> Result<(), NetError> {
        match self.owners.entry(canonical_key(addr)) {
            Entry::Occupied(_) => Err(NetError::DuplicateConnection(addr)),
            Entry::Vacant(slot) => {
                slot.insert(owner);
                Ok(())
            }
        }
    }

    /// Removes the entry for an endpoint. Idempotent; removes regardless
    /// of owner identity, so teardown can never strand a stale entry.
    pub fn remove(&self, addr: SocketAddr) {
        if self.owners.remove(&canonical_key(addr)).is_some() {
            debug!(peer = %addr, "connection deregistered");
        }
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    /// Returns the owner for `addr`, dialing a fresh connection when none
    /// is registered. Concurrent callers racing on the same endpoint are
    /// serialized; losers adopt the winner's owner.
    pub fn ensure_connection(
        self: &Arc<Self>,
        addr: SocketAddr,
        outbox: Sender<InboundFrame>,
    ) -> Result<Arc<SocketOwner>, NetError> {
        if let Some(owner) = self.lookup(addr) {
            return Ok(owner);
        }

        let _guard = self.dial_lock.lock();
        if let Some(owner) = self.lookup(addr) {
            // Lost the race; the winner already dialed.
            return Ok(owner);
        }

        info!(peer = %addr, "establishing gossip connection");
        let stream =
            TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(NetError::ConnectFailed)?;
        let owner = SocketOwner::spawn(stream, addr, outbox, Arc::clone(self))
            .map_err(NetError::ConnectFailed)?;

        if self.insert(addr, Arc::clone(&owner)).is_err() {
            // An inbound accept from the same endpoint slipped in between
            // our lookup and insert. Keep theirs, fold ours.
            warn!(peer = %addr, "connection race with inbound accept");
            owner.shutdown();
            if let Some(existing) = self.lookup(addr) {
                return Ok(existing);
            }
            return Err(NetError::DuplicateConnection(addr));
        }
        Ok(owner)
    }

    /// Requests teardown of every registered owner. Entries remove
    /// themselves as each owner finishes closing.
    pub fn clear(&self) {
        let owners: Vec<Arc<SocketOwner>> =
            self.owners.iter().map(|e| e.value().clone()).collect();
        info!(count = owners.len(), "clearing connection registry");
        for owner in owners {
            owner.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    use crossbeam::channel::unbounded;

    fn owner_pair() -> (Arc<ConnectionRegistry>, Arc<SocketOwner>, SocketAddr, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        let (tx, _rx) = unbounded();
        let registry = ConnectionRegistry::new();
        let owner = SocketOwner::spawn(stream, addr, tx, Arc::clone(&registry)).unwrap();
        (registry, owner, addr, listener)
    }

    #[test]
    fn insert_then_duplicate_fails() {
        let (registry, owner, addr, _listener) = owner_pair();
        registry.insert(addr, Arc::clone(&owner)).unwrap();
        assert!(matches!(
            registry.insert(addr, Arc::clone(&owner)),
            Err(NetError::DuplicateConnection(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let (registry, owner, addr, _listener) = owner_pair();
        registry.insert(addr, owner).unwrap();
        registry.remove(addr);
        registry.remove(addr);
        assert!(registry.is_empty());
    }

    #[test]
    fn equivalent_address_spellings_collide() {
        let (registry, owner, addr, _listener) = owner_pair();
        registry.insert(addr, Arc::clone(&owner)).unwrap();

        let mapped: SocketAddr = format!("[::ffff:127.0.0.1]:{}", addr.port()).parse().unwrap();
        assert!(registry.lookup(mapped).is_some());
        assert!(matches!(
            registry.insert(mapped, owner),
            Err(NetError::DuplicateConnection(_))
        ));
    }

    #[test]
    fn connect_failure_is_surfaced() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = unbounded();
        // A port nothing listens on: bind, learn the port, drop the listener.
        let doomed = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let result = registry.ensure_connection(doomed, tx);
        assert!(matches!(result, Err(NetError::ConnectFailed(_))));
        assert!(registry.is_empty());
    }
}
