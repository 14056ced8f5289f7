//! # Node Registry & UID Allocation
//!
//! Process-wide mapping from node UID to the thing that answers for it: a
//! local gossip node actor or a proxy standing in for a remote one. The
//! registry is the only way application code reaches a node — handles are
//! resolved per use, so a node that has been torn down surfaces as a miss
//! instead of a dangling reference.
//!
//! UID allocation runs in two regimes: `Tiny` hands out small sequential
//! integers for simulations and tests (readable logs matter when you're
//! staring at a 50-node trace), `Normal` hands out time-prefixed values
//! that stay unique across process restarts. Both are monotonic within
//! their regime. UID 0 is reserved for anonymous broadcast and is never
//! allocated.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::node::NodeHandle;
use crate::proxy::ProxyNode;

// ---------------------------------------------------------------------------
// NodeUid
// ---------------------------------------------------------------------------

/// Unique per-process node identifier.
///
/// UID 0 is the anonymous-broadcast address: a frame sent to it is routed
/// to every local node on the receiving process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct NodeUid(pub u64);

impl NodeUid {
    /// The anonymous-broadcast destination.
    pub const ANONYMOUS: NodeUid = NodeUid(0);

    /// Whether this UID addresses "any/all nodes on the peer process".
    pub fn is_anonymous(self) -> bool {
        self == Self::ANONYMOUS
    }
}

impl fmt::Display for NodeUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// UID Allocation
// ---------------------------------------------------------------------------

/// UID allocation regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UidRegime {
    /// Small sequential integers starting at 1. For simulation and tests.
    Tiny,
    /// Time- and salt-prefixed values, unique across restarts as long as
    /// the clock moves forward.
    Normal,
}

/// Monotonic UID allocator. Switching regimes does not reset either
/// sequence, so a UID is never handed out twice in one process lifetime.
pub struct UidAllocator {
    regime: Mutex<UidRegime>,
    tiny_next: AtomicU64,
    normal_next: AtomicU64,
}

/// Salts each allocator instance so co-started processes (and co-tenant
/// registries in one process) do not mint overlapping normal-regime UIDs.
static ALLOCATOR_SALT: AtomicU64 = AtomicU64::new(0);

impl UidAllocator {
    pub fn new(regime: UidRegime) -> Self {
        let salt =
            ALLOCATOR_SALT.fetch_add(1, Ordering::Relaxed) ^ u64::from(std::process::id());
        let base = (unix_seconds() << 24) | ((salt & 0xFF) << 16);
        Self {
            regime: Mutex::new(regime),
            tiny_next: AtomicU64::new(1),
            normal_next: AtomicU64::new(base | 1),
        }
    }

    /// Switches the allocation regime for subsequent allocations.
    pub fn set_regime(&self, regime: UidRegime) {
        *self.regime.lock() = regime;
    }

    pub fn regime(&self) -> UidRegime {
        *self.regime.lock()
    }

    /// Allocates the next UID in the current regime. Never returns 0.
    pub fn allocate(&self) -> NodeUid {
        let regime = *self.regime.lock();
        let raw = match regime {
            UidRegime::Tiny => self.tiny_next.fetch_add(1, Ordering::Relaxed),
            UidRegime::Normal => self.normal_next.fetch_add(1, Ordering::Relaxed),
        };
        NodeUid(raw)
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ---------------------------------------------------------------------------
// Node Registry
// ---------------------------------------------------------------------------

/// What a UID resolves to: an in-process actor or a remote stand-in.
#[derive(Clone)]
pub enum NodeEntry {
    /// A local gossip node actor.
    Local(Arc<NodeHandle>),
    /// A proxy for a node on a peer process.
    Proxy(Arc<ProxyNode>),
}

/// Process-wide `uid → node` mapping plus the UID allocator.
///
/// All operations are atomic with respect to each other. The address index
/// maps a peer IP to the proxies registered for it, which is how inbound
/// frames are attributed to a source neighbor.
pub struct NodeRegistry {
    nodes: DashMap<NodeUid, NodeEntry>,
    by_addr: DashMap<IpAddr, HashSet<NodeUid>>,
    allocator: UidAllocator,
}

impl NodeRegistry {
    pub fn new(regime: UidRegime) -> Arc<Self> {
        Arc::new(Self {
            nodes: DashMap::new(),
            by_addr: DashMap::new(),
            allocator: UidAllocator::new(regime),
        })
    }

    /// Allocates a fresh UID in the current regime.
    pub fn allocate_uid(&self) -> NodeUid {
        self.allocator.allocate()
    }

    /// Switches the UID allocation regime.
    pub fn set_regime(&self, regime: UidRegime) {
        info!(?regime, "switching uid allocation regime");
        self.allocator.set_regime(regime);
    }

    pub fn regime(&self) -> UidRegime {
        self.allocator.regime()
    }

    /// Registers a local node actor under its UID.
    pub fn register_local(&self, handle: Arc<NodeHandle>) {
        let uid = handle.uid();
        debug!(%uid, "registering local node");
        self.nodes.insert(uid, NodeEntry::Local(handle));
    }

    /// Registers a proxy under its local-side UID and indexes it by the
    /// remote peer address for inbound source attribution.
    pub fn register_proxy(&self, proxy: Arc<ProxyNode>) {
        let uid = proxy.uid();
        let ip = proxy.remote_addr().ip();
        debug!(%uid, remote = %proxy.remote_addr(), "registering proxy node");
        self.by_addr.entry(ip).or_default().insert(uid);
        self.nodes.insert(uid, NodeEntry::Proxy(proxy));
    }

    /// Resolves a UID to its entry.
    pub fn get(&self, uid: NodeUid) -> Option<NodeEntry> {
        self.nodes.get(&uid).map(|e| e.value().clone())
    }

    pub fn contains(&self, uid: NodeUid) -> bool {
        self.nodes.contains_key(&uid)
    }

    /// All local node handles, in no particular order.
    pub fn local_handles(&self) -> Vec<Arc<NodeHandle>> {
        self.nodes
            .iter()
            .filter_map(|e| match e.value() {
                NodeEntry::Local(h) => Some(Arc::clone(h)),
                NodeEntry::Proxy(_) => None,
            })
            .collect()
    }

    /// Attributes an inbound peer address to a source neighbor UID.
    ///
    /// Returns the proxy UID only when the mapping is unambiguous. With
    /// several proxies behind one IP (co-tenant processes) the source is
    /// reported as unknown; loop suppression does not depend on it and a
    /// forward back toward the sender is dropped by its seen cache.
    pub fn source_for_addr(&self, ip: IpAddr) -> Option<NodeUid> {
        let set = self.by_addr.get(&ip)?;
        let mut live = set.iter().filter(|uid| self.nodes.contains_key(*uid));
        let first = live.next().copied()?;
        match live.next() {
            None => Some(first),
            Some(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Removes a single entry. Local actors are shut down and joined.
    pub fn remove(&self, uid: NodeUid) {
        if let Some((_, entry)) = self.nodes.remove(&uid) {
            if let NodeEntry::Local(handle) = entry {
                handle.shutdown();
            }
        }
        self.by_addr.retain(|_, uids| {
            uids.remove(&uid);
            !uids.is_empty()
        });
    }

    /// Tears down every registered node. Local actors are shut down and
    /// joined; proxies are simply dropped.
    pub fn clear(&self) {
        let uids: Vec<NodeUid> = self.nodes.iter().map(|e| *e.key()).collect();
        info!(count = uids.len(), "clearing node registry");
        for uid in uids {
            self.remove(uid);
        }
        self.by_addr.clear();
    }
}
