//! # Fleet Runtime
//!
//! The supervisor wiring one process's gossip machinery together: both
//! registries, the verb table, the inbound router, and the listener. This
//! is also the administrative surface — start/stop the listener, clear the
//! node registry, switch UID regimes, build a topology — so application
//! code never mutates the registries directly.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

use crate::config::{GossipSettings, Protocol};
use crate::gossip::GossipConfig;
use crate::graph::{wire_fleet, GraphError};
use crate::net::{spawn_router, ConnectionRegistry, GossipListener, InboundFrame, NetError};
use crate::node::{LocalNode, NodeHandle};
use crate::proxy::ProxyNode;
use crate::registry::{NodeRegistry, NodeUid, UidRegime};
use crate::verbs::VerbRegistry;

/// Fleet bring-up and administration failures.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("UDP transport is not implemented")]
    UnsupportedProtocol,
}

/// One process's gossip runtime.
pub struct Fleet {
    settings: GossipSettings,
    gossip_config: GossipConfig,
    nodes: Arc<NodeRegistry>,
    connections: Arc<ConnectionRegistry>,
    verbs: Arc<VerbRegistry>,
    inbound_tx: Sender<InboundFrame>,
    _router: JoinHandle<()>,
    listener: Mutex<Option<GossipListener>>,
}

impl Fleet {
    /// Builds the runtime: registries, verb table with the built-ins, and
    /// the inbound router. The listener is not started; call
    /// [`start_listener`](Self::start_listener) when ready to accept.
    pub fn new(settings: GossipSettings) -> Result<Arc<Self>, FleetError> {
        Self::with_gossip_config(settings, GossipConfig::default())
    }

    /// Like [`new`](Self::new) with explicit propagation tuning.
    pub fn with_gossip_config(
        settings: GossipSettings,
        gossip_config: GossipConfig,
    ) -> Result<Arc<Self>, FleetError> {
        if settings.preferred_protocol == Protocol::Udp {
            return Err(FleetError::UnsupportedProtocol);
        }

        let nodes = NodeRegistry::new(UidRegime::Normal);
        let connections = ConnectionRegistry::new();
        let verbs = VerbRegistry::with_builtins();
        let (inbound_tx, inbound_rx) = unbounded();
        let router = spawn_router(inbound_rx, Arc::clone(&nodes));

        Ok(Arc::new(Self {
            settings,
            gossip_config,
            nodes,
            connections,
            verbs,
            inbound_tx,
            _router: router,
            listener: Mutex::new(None),
        }))
    }

    pub fn settings(&self) -> &GossipSettings {
        &self.settings
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn verbs(&self) -> &Arc<VerbRegistry> {
        &self.verbs
    }

    // -- Admin surface -------------------------------------------------------

    /// Starts the listener on the configured address and port. Idempotent;
    /// returns the bound address.
    pub fn start_listener(&self) -> Result<SocketAddr, NetError> {
        let mut guard = self.listener.lock();
        if let Some(listener) = guard.as_ref() {
            return Ok(listener.local_addr());
        }
        let ip = self
            .settings
            .eripa
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let listener = GossipListener::bind(
            SocketAddr::new(ip, self.settings.gossip_port),
            Arc::clone(&self.connections),
            self.inbound_tx.clone(),
        )?;
        let local = listener.local_addr();
        *guard = Some(listener);
        Ok(local)
    }

    /// Stops accepting inbound connections. Existing connections survive.
    pub fn stop_listener(&self) {
        if let Some(mut listener) = self.listener.lock().take() {
            listener.stop();
        }
    }

    /// Switches UID allocation between `tiny` and `normal`.
    pub fn set_uid_regime(&self, regime: UidRegime) {
        self.nodes.set_regime(regime);
    }

    /// Tears down every local node actor and drops all proxies.
    pub fn clear_nodes(&self) {
        self.nodes.clear();
    }

    /// Full teardown: listener, nodes, connections.
    pub fn shutdown(&self) {
        info!("fleet shutting down");
        self.stop_listener();
        self.nodes.clear();
        self.connections.clear();
    }

    // -- Nodes and topology --------------------------------------------------

    /// Spawns one local gossip node actor.
    pub fn spawn_node(&self) -> Arc<NodeHandle> {
        LocalNode::spawn(&self.nodes, Arc::clone(&self.verbs), self.gossip_config.clone())
    }

    /// Spawns `n` local gossip node actors.
    pub fn spawn_nodes(&self, n: usize) -> Vec<Arc<NodeHandle>> {
        (0..n).map(|_| self.spawn_node()).collect()
    }

    /// Wires the current local nodes into a connected topology with the
    /// given degree bound, deterministically from `seed`.
    pub fn build_graph(&self, max_degree: usize, seed: u64) -> Result<usize, GraphError> {
        let mut handles = self.nodes.local_handles();
        handles.sort_by_key(|h| h.uid());
        wire_fleet(&handles, max_degree, seed)
    }

    /// Connects to a peer process (reusing any live connection) and
    /// registers a proxy for `remote_uid` there. Use
    /// [`NodeUid::ANONYMOUS`] to address all of the peer's nodes.
    pub fn add_peer(
        &self,
        remote_addr: SocketAddr,
        remote_uid: NodeUid,
    ) -> Result<Arc<ProxyNode>, NetError> {
        self.connections
            .ensure_connection(remote_addr, self.inbound_tx.clone())?;
        let uid = self.nodes.allocate_uid();
        let proxy = ProxyNode::new(uid, remote_uid, remote_addr, Arc::clone(&self.connections));
        self.nodes.register_proxy(Arc::clone(&proxy));
        Ok(proxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Payload, VERB_COUNT_ALIVE};

    fn local_settings() -> GossipSettings {
        GossipSettings {
            eripa: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            gossip_port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn udp_is_a_configuration_error() {
        let settings = GossipSettings {
            preferred_protocol: Protocol::Udp,
            ..Default::default()
        };
        assert!(matches!(
            Fleet::new(settings),
            Err(FleetError::UnsupportedProtocol)
        ));
    }

    #[test]
    fn listener_start_is_idempotent() {
        let fleet = Fleet::new(local_settings()).unwrap();
        let first = fleet.start_listener().unwrap();
        let second = fleet.start_listener().unwrap();
        assert_eq!(first, second);
        fleet.shutdown();
    }

    #[test]
    fn tiny_regime_fleet_solicits_over_a_built_graph() {
        let fleet = Fleet::new(local_settings()).unwrap();
        fleet.set_uid_regime(UidRegime::Tiny);

        let handles = fleet.spawn_nodes(6);
        fleet.build_graph(3, 11).unwrap();

        let outcome = handles[0]
            .solicit_wait(VERB_COUNT_ALIVE, Payload::None)
            .expect("aggregate");
        assert_eq!(outcome.aggregate, Payload::Count(6));
        assert!(!outcome.partial);
        fleet.shutdown();
    }

    #[test]
    fn clear_nodes_empties_the_registry() {
        let fleet = Fleet::new(local_settings()).unwrap();
        fleet.spawn_nodes(3);
        assert_eq!(fleet.nodes().len(), 3);
        fleet.clear_nodes();
        assert!(fleet.nodes().is_empty());
        fleet.shutdown();
    }
}
