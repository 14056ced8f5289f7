//! End-to-end integration tests for the EMBER gossip core.
//!
//! These tests stand up two complete fleet runtimes in one process — each
//! with its own registries, listener, and router — and gossip between
//! them over real loopback TCP. They prove that the layers compose: verb
//! dispatch, admission, proxy forwarding, wire framing, socket ownership,
//! readiness monitoring, inbound routing, and solicitation aggregation.
//!
//! Each test stands alone with its own fleets and ephemeral ports. No
//! shared state, no test ordering dependencies, no fixed port numbers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ember_protocol::config::GossipSettings;
use ember_protocol::gossip::GossipConfig;
use ember_protocol::message::{Message, Payload, VERB_COUNT_ALIVE};
use ember_protocol::node::NodeHandle;
use ember_protocol::proxy::ProxyError;
use ember_protocol::registry::{NodeUid, UidRegime};
use ember_protocol::runtime::Fleet;
use ember_protocol::verbs::{NodeView, VerbHandler};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn local_settings() -> GossipSettings {
    GossipSettings {
        eripa: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        gossip_port: 0,
        ..Default::default()
    }
}

fn fast_config() -> GossipConfig {
    GossipConfig {
        ttl_seconds: 30,
        solicit_deadline_ms: 500,
    }
}

/// One listening fleet with `n` local nodes.
fn start_fleet(n: usize) -> (Arc<Fleet>, Vec<Arc<NodeHandle>>, SocketAddr) {
    let fleet = Fleet::with_gossip_config(local_settings(), fast_config()).unwrap();
    fleet.set_uid_regime(UidRegime::Normal);
    let handles = fleet.spawn_nodes(n);
    let addr = fleet.start_listener().unwrap();
    (fleet, handles, addr)
}

/// Polls until `check` passes or the window elapses.
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

struct Tally(AtomicUsize);

impl VerbHandler for Tally {
    fn apply(&self, _node: &NodeView, _message: &Message) -> Option<Payload> {
        self.0.fetch_add(1, Ordering::SeqCst);
        None
    }
}

// ---------------------------------------------------------------------------
// Cross-process gossip
// ---------------------------------------------------------------------------

#[test]
fn two_fleets_count_each_other() {
    let (fleet_a, nodes_a, addr_a) = start_fleet(1);
    let (fleet_b, nodes_b, addr_b) = start_fleet(1);
    let (a, b) = (&nodes_a[0], &nodes_b[0]);

    let proxy_ab = fleet_a.add_peer(addr_b, b.uid()).unwrap();
    a.add_neighbor(proxy_ab.uid());
    let proxy_ba = fleet_b.add_peer(addr_a, a.uid()).unwrap();
    b.add_neighbor(proxy_ba.uid());

    let outcome = a
        .solicit_wait(VERB_COUNT_ALIVE, Payload::None)
        .expect("aggregate over both fleets");
    assert_eq!(outcome.aggregate, Payload::Count(2));
    assert!(!outcome.partial);

    fleet_a.shutdown();
    fleet_b.shutdown();
}

#[test]
fn broadcast_crosses_the_wire_exactly_once() {
    let (fleet_a, nodes_a, addr_a) = start_fleet(1);
    let (fleet_b, nodes_b, addr_b) = start_fleet(1);
    let (a, b) = (&nodes_a[0], &nodes_b[0]);

    let tally_a = Arc::new(Tally(AtomicUsize::new(0)));
    let tally_b = Arc::new(Tally(AtomicUsize::new(0)));
    fleet_a
        .verbs()
        .register("tally", Arc::clone(&tally_a) as Arc<dyn VerbHandler>);
    fleet_b
        .verbs()
        .register("tally", Arc::clone(&tally_b) as Arc<dyn VerbHandler>);

    let proxy_ab = fleet_a.add_peer(addr_b, b.uid()).unwrap();
    a.add_neighbor(proxy_ab.uid());
    let proxy_ba = fleet_b.add_peer(addr_a, a.uid()).unwrap();
    b.add_neighbor(proxy_ba.uid());

    a.broadcast("tally", Payload::None);

    assert!(eventually(|| tally_b.0.load(Ordering::SeqCst) == 1));
    assert_eq!(tally_a.0.load(Ordering::SeqCst), 1);

    // Neighbor exclusion keeps B from echoing the message back, and the
    // seen caches hold at one firing per node either way.
    thread::sleep(Duration::from_millis(150));
    assert_eq!(tally_a.0.load(Ordering::SeqCst), 1);
    assert_eq!(tally_b.0.load(Ordering::SeqCst), 1);

    fleet_a.shutdown();
    fleet_b.shutdown();
}

#[test]
fn anonymous_broadcast_reaches_every_node_on_the_peer() {
    let (fleet_a, nodes_a, _addr_a) = start_fleet(1);
    let (fleet_b, nodes_b, addr_b) = start_fleet(2);
    let a = &nodes_a[0];

    let proxy = fleet_a.add_peer(addr_b, NodeUid::ANONYMOUS).unwrap();
    a.add_neighbor(proxy.uid());

    a.broadcast(VERB_COUNT_ALIVE, Payload::None);

    assert!(eventually(|| {
        nodes_b
            .iter()
            .all(|n| n.stats().is_some_and(|s| s.admitted == 1))
    }));

    fleet_a.shutdown();
    fleet_b.shutdown();
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[test]
fn torn_down_peer_yields_partial_and_proxy_errors() {
    let (fleet_a, nodes_a, _addr_a) = start_fleet(1);
    let (fleet_b, nodes_b, addr_b) = start_fleet(1);
    let (a, b) = (&nodes_a[0], &nodes_b[0]);

    let proxy = fleet_a.add_peer(addr_b, b.uid()).unwrap();
    a.add_neighbor(proxy.uid());

    // Peer goes away entirely.
    fleet_b.shutdown();
    assert!(eventually(|| fleet_a.connections().is_empty()));

    // The proxy is non-forwarding now.
    let message = Message::command(
        VERB_COUNT_ALIVE,
        a.uid(),
        30,
        Payload::None,
        ember_protocol::message::unix_now_secs(),
    );
    let err = proxy.forward(&message).unwrap_err();
    assert!(matches!(
        err,
        ProxyError::Unreachable(_) | ProxyError::Closed(_)
    ));

    // A solicitation can only drain via its deadline: partial, count 1.
    let outcome = a
        .solicit_wait(VERB_COUNT_ALIVE, Payload::None)
        .expect("partial aggregate");
    assert_eq!(outcome.aggregate, Payload::Count(1));
    assert!(outcome.partial);

    fleet_a.shutdown();
}

#[test]
fn listener_stop_refuses_new_connections_but_keeps_existing() {
    let (fleet_a, nodes_a, _addr_a) = start_fleet(1);
    let (fleet_b, nodes_b, addr_b) = start_fleet(1);
    let (a, b) = (&nodes_a[0], &nodes_b[0]);

    let proxy = fleet_a.add_peer(addr_b, b.uid()).unwrap();
    a.add_neighbor(proxy.uid());

    fleet_b.stop_listener();

    // The established connection still carries frames.
    a.broadcast(VERB_COUNT_ALIVE, Payload::None);
    assert!(eventually(|| b.stats().is_some_and(|s| s.admitted == 1)));

    fleet_a.shutdown();
    fleet_b.shutdown();
}
