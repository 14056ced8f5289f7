//! # Listener & Inbound Router
//!
//! The listener accepts inbound gossip connections and hands each socket
//! to a fresh [`SocketOwner`]. The router is the shared outbox consumer:
//! it resolves each decoded frame's destination UID against the node
//! registry and delivers it to the local node actor, attributing the
//! source neighbor by peer address. Unknown destinations are logged and
//! dropped; the anonymous destination (UID 0) fans out to every local
//! node.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::message::Envelope;
use crate::registry::{NodeEntry, NodeRegistry};

use super::owner::{InboundFrame, SocketOwner};
use super::registry::ConnectionRegistry;
use super::NetError;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Spawns the inbound dispatch thread. It runs until every frame producer
/// (listener, owners, fleet handle) has dropped its sender.
pub fn spawn_router(inbound: Receiver<InboundFrame>, nodes: Arc<NodeRegistry>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("gossip-router".into())
        .spawn(move || {
            for frame in inbound {
                route_frame(&nodes, frame);
            }
            debug!("inbound router stopped");
        })
        .expect("spawn router thread")
}

fn route_frame(nodes: &Arc<NodeRegistry>, frame: InboundFrame) {
    let source = nodes.source_for_addr(frame.peer.ip());
    let Envelope {
        destination,
        message,
    } = frame.envelope;

    if destination.is_anonymous() {
        // Anonymous broadcast: every local node takes delivery, each as if
        // it came from the attributed neighbor.
        for handle in nodes.local_handles() {
            handle.deliver(source, message.clone());
        }
        return;
    }

    match nodes.get(destination) {
        Some(NodeEntry::Local(handle)) => {
            handle.deliver(source, message);
        }
        Some(NodeEntry::Proxy(_)) => {
            warn!(%destination, peer = %frame.peer, "inbound frame addressed to a proxy, dropping");
        }
        None => {
            warn!(%destination, peer = %frame.peer, "unknown destination uid, dropping frame");
        }
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Accept loop for inbound gossip connections.
pub struct GossipListener {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    accept_join: Option<JoinHandle<()>>,
}

impl GossipListener {
    /// Binds and starts accepting. Every accepted socket is wrapped in a
    /// socket owner and registered under the peer's endpoint.
    pub fn bind(
        bind_addr: SocketAddr,
        connections: Arc<ConnectionRegistry>,
        outbox: Sender<InboundFrame>,
    ) -> Result<Self, NetError> {
        let listener = TcpListener::bind(bind_addr).map_err(NetError::Bind)?;
        let local_addr = listener.local_addr().map_err(NetError::Bind)?;
        let running = Arc::new(AtomicBool::new(true));

        let accept_running = Arc::clone(&running);
        let accept_join = thread::Builder::new()
            .name(format!("gossip-accept-{}", local_addr.port()))
            .spawn(move || run_accept_loop(listener, accept_running, connections, outbox))
            .map_err(NetError::Bind)?;

        info!(%local_addr, "gossip listener started");
        Ok(Self {
            local_addr,
            running,
            accept_join: Some(accept_join),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and joins the accept thread. Existing connections
    /// are untouched; tearing those down is the connection registry's job.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Wake the blocking accept with a throwaway connection.
        let _ = TcpStream::connect_timeout(&self.wake_addr(), Duration::from_millis(250));
        if let Some(join) = self.accept_join.take() {
            let _ = join.join();
        }
        info!(local_addr = %self.local_addr, "gossip listener stopped");
    }

    fn wake_addr(&self) -> SocketAddr {
        let ip = if self.local_addr.ip().is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.local_addr.ip()
        };
        SocketAddr::new(ip, self.local_addr.port())
    }
}

impl Drop for GossipListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_accept_loop(
    listener: TcpListener,
    running: Arc<AtomicBool>,
    connections: Arc<ConnectionRegistry>,
    outbox: Sender<InboundFrame>,
) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                debug!(%peer, "accepted gossip connection");
                match SocketOwner::spawn(stream, peer, outbox.clone(), Arc::clone(&connections)) {
                    Ok(owner) => {
                        if connections.insert(peer, Arc::clone(&owner)).is_err() {
                            warn!(%peer, "duplicate inbound endpoint, dropping fresh connection");
                            owner.shutdown();
                        }
                    }
                    Err(e) => {
                        warn!(%peer, error = %e, "failed to take ownership of accepted socket");
                    }
                }
            }
            Err(e) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                warn!(error = %e, "accept failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crossbeam::channel::unbounded;

    use crate::gossip::GossipConfig;
    use crate::message::{Message, Payload, VERB_COUNT_ALIVE};
    use crate::node::LocalNode;
    use crate::registry::{NodeUid, UidRegime};
    use crate::verbs::VerbRegistry;

    fn eventually(check: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    /// A listening endpoint with its own registries and router.
    struct Harness {
        nodes: Arc<NodeRegistry>,
        connections: Arc<ConnectionRegistry>,
        listener: GossipListener,
        _router: JoinHandle<()>,
        outbox: Sender<InboundFrame>,
    }

    impl Harness {
        fn start() -> Self {
            let nodes = NodeRegistry::new(UidRegime::Tiny);
            let connections = ConnectionRegistry::new();
            let (outbox, inbound) = unbounded();
            let router = spawn_router(inbound, Arc::clone(&nodes));
            let listener = GossipListener::bind(
                "127.0.0.1:0".parse().unwrap(),
                Arc::clone(&connections),
                outbox.clone(),
            )
            .unwrap();
            Self {
                nodes,
                connections,
                listener,
                _router: router,
                outbox,
            }
        }
    }

    #[test]
    fn concurrent_ensure_connection_yields_one_owner() {
        let server = Harness::start();
        let addr = server.listener.local_addr();

        let client = ConnectionRegistry::new();
        let (tx, _rx) = unbounded();

        let c1 = Arc::clone(&client);
        let c2 = Arc::clone(&client);
        let (tx1, tx2) = (tx.clone(), tx);
        let h1 = thread::spawn(move || c1.ensure_connection(addr, tx1).unwrap());
        let h2 = thread::spawn(move || c2.ensure_connection(addr, tx2).unwrap());
        let o1 = h1.join().unwrap();
        let o2 = h2.join().unwrap();

        assert!(Arc::ptr_eq(&o1, &o2), "racers must share one owner");
        assert_eq!(client.len(), 1);
    }

    #[test]
    fn inbound_frame_reaches_the_destination_node() {
        let server = Harness::start();
        let verbs = VerbRegistry::with_builtins();
        let node = LocalNode::spawn(&server.nodes, verbs, GossipConfig::default());

        let client = ConnectionRegistry::new();
        let (tx, _rx) = unbounded();
        let owner = client
            .ensure_connection(server.listener.local_addr(), tx)
            .unwrap();

        let message = Message::command(
            VERB_COUNT_ALIVE,
            NodeUid(99),
            30,
            Payload::None,
            crate::message::unix_now_secs(),
        );
        owner
            .send(Envelope {
                destination: node.uid(),
                message,
            })
            .unwrap();

        assert!(eventually(|| node.stats().is_some_and(|s| s.admitted == 1)));
        server.nodes.clear();
    }

    #[test]
    fn anonymous_destination_fans_out_to_every_local_node() {
        let server = Harness::start();
        let verbs = VerbRegistry::with_builtins();
        let a = LocalNode::spawn(&server.nodes, Arc::clone(&verbs), GossipConfig::default());
        let b = LocalNode::spawn(&server.nodes, verbs, GossipConfig::default());

        let client = ConnectionRegistry::new();
        let (tx, _rx) = unbounded();
        let owner = client
            .ensure_connection(server.listener.local_addr(), tx)
            .unwrap();

        let message = Message::command(
            VERB_COUNT_ALIVE,
            NodeUid(99),
            30,
            Payload::None,
            crate::message::unix_now_secs(),
        );
        owner
            .send(Envelope {
                destination: NodeUid::ANONYMOUS,
                message,
            })
            .unwrap();

        assert!(eventually(|| {
            a.stats().is_some_and(|s| s.admitted == 1)
                && b.stats().is_some_and(|s| s.admitted == 1)
        }));
        server.nodes.clear();
    }

    #[test]
    fn unknown_destination_is_dropped_not_fatal() {
        let server = Harness::start();
        let verbs = VerbRegistry::with_builtins();
        let node = LocalNode::spawn(&server.nodes, verbs, GossipConfig::default());

        let client = ConnectionRegistry::new();
        let (tx, _rx) = unbounded();
        let owner = client
            .ensure_connection(server.listener.local_addr(), tx)
            .unwrap();

        let stray = Message::command(
            VERB_COUNT_ALIVE,
            NodeUid(99),
            30,
            Payload::None,
            crate::message::unix_now_secs(),
        );
        owner
            .send(Envelope {
                destination: NodeUid(4242),
                message: stray,
            })
            .unwrap();

        // A valid frame afterwards still routes: the stream survived.
        let valid = Message::command(
            VERB_COUNT_ALIVE,
            NodeUid(99),
            30,
            Payload::None,
            crate::message::unix_now_secs(),
        );
        owner
            .send(Envelope {
                destination: node.uid(),
                message: valid,
            })
            .unwrap();

        assert!(eventually(|| node.stats().is_some_and(|s| s.admitted == 1)));
        server.nodes.clear();
    }

    #[test]
    fn peer_hangup_closes_the_owner_and_clears_the_registry() {
        let server = Harness::start();
        let addr = server.listener.local_addr();

        let client = ConnectionRegistry::new();
        let (tx, _rx) = unbounded();
        let owner = client.ensure_connection(addr, tx).unwrap();
        assert_eq!(client.len(), 1);

        // The server side accepted and registered its own owner.
        assert!(eventually(|| server.connections.len() == 1));

        // Server hangs up on us.
        server.connections.clear();

        assert!(eventually(|| !owner.is_open()));
        assert!(eventually(|| client.is_empty()));

        let message = Message::command(
            VERB_COUNT_ALIVE,
            NodeUid(99),
            30,
            Payload::None,
            crate::message::unix_now_secs(),
        );
        let err = owner
            .send(Envelope {
                destination: NodeUid(1),
                message,
            })
            .unwrap_err();
        assert!(matches!(err, NetError::Closed));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let server = Harness::start();
        let client = ConnectionRegistry::new();
        let (tx, _rx) = unbounded();
        let owner = client
            .ensure_connection(server.listener.local_addr(), tx)
            .unwrap();

        owner.shutdown();
        assert!(eventually(|| !owner.is_open()));
        let len_after_first = client.len();

        owner.shutdown();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(client.len(), len_after_first);
        assert!(client.is_empty());
    }

    #[test]
    fn listener_stop_joins_the_accept_thread() {
        let mut listener = {
            let server = Harness::start();
            // Detach the pieces we need; dropping the harness drops the
            // outbox clone it held.
            let Harness {
                listener, outbox, ..
            } = server;
            drop(outbox);
            listener
        };
        listener.stop();
        listener.stop();
    }
}
