//! # Protocol Configuration & Constants
//!
//! Every magic number in EMBER lives here. If you're hardcoding a constant
//! somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! The [`GossipSettings`] bag is the per-process configuration surface: the
//! externally routable address, bootstrap peers, ports, and how many local
//! gossip nodes this process hosts. Everything else is a tuning constant.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Network Parameters
// ---------------------------------------------------------------------------

/// Default gossip listening port. Picked because it wasn't taken.
pub const DEFAULT_GOSSIP_PORT: u16 = 9310;

/// Co-tenant processes on the same host derive their listening port by
/// adding this offset to the primary port.
pub const SECONDARY_PORT_OFFSET: u16 = 1;

/// TCP connect timeout for outbound connection establishment. Ten seconds
/// to establish or we move on — life's too short for slow peers.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-frame I/O timeout on an owned socket. A peer that stalls mid-frame
/// for this long is treated as dead and the connection is torn down.
pub const FRAME_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a readiness monitor waits without any socket activity before
/// it presumes the peer closed cleanly and posts a shutdown.
pub const MONITOR_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Upper bound on a single wire frame. Gossip payloads are small; anything
/// this large is either a bug or an attack, and either way we hang up.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

// ---------------------------------------------------------------------------
// Propagation Parameters
// ---------------------------------------------------------------------------

/// Default message time-to-live in seconds. A message injected now is
/// forwarded for this long; its cache entry survives for twice as long so
/// late stragglers cannot resurrect it.
pub const DEFAULT_TTL_SECONDS: u64 = 30;

/// Default solicitation deadline in milliseconds. When the deadline fires
/// with replies still outstanding, whatever aggregate exists is returned
/// with the partial marker set.
pub const DEFAULT_SOLICIT_DEADLINE_MS: u64 = 2_000;

/// Default maximum vertex degree for built graphs. Too high and every
/// broadcast is a bandwidth storm; too low and the diameter balloons.
pub const DEFAULT_MAX_DEGREE: usize = 8;

/// Grace added on top of the solicitation deadline before a blocked
/// caller gives up entirely. Covers the actor's flush-and-deliver hop.
pub const SOLICIT_GRACE_MS: u64 = 250;

/// How often a node actor sweeps its seen cache for hard-expired entries.
pub const SEEN_GC_INTERVAL_MS: u64 = 5_000;

/// Idle wake-up interval for a node actor with no pending deadlines.
/// Bounds how stale the cache sweep can get on a quiet node.
pub const NODE_IDLE_TICK_MS: u64 = 1_000;

// ---------------------------------------------------------------------------
// Transport Selection
// ---------------------------------------------------------------------------

/// Transport protocol selector. UDP is accepted by the parser so operators
/// get a clear error instead of a silent fallback, but only TCP is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// Stream transport. The only one actually implemented.
    Tcp,
    /// Datagram transport. Parsed, validated, not implemented.
    Udp,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Tcp
    }
}

// ---------------------------------------------------------------------------
// Settings Bag
// ---------------------------------------------------------------------------

/// Per-process gossip configuration.
///
/// Deserializable from a JSON settings file; every field has a default so a
/// bare `{}` is a valid configuration for a single-node devnet process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipSettings {
    /// Externally routable address of this node. `None` means auto-detect
    /// at bind time (bind to the unspecified address and let peers use
    /// whatever address they already know us by).
    pub eripa: Option<IpAddr>,

    /// Bootstrap list of peer addresses to connect to at startup.
    pub all_known_addresses: Vec<SocketAddr>,

    /// Listening port for inbound gossip connections.
    pub gossip_port: u16,

    /// Transport selector. Only [`Protocol::Tcp`] is implemented.
    pub preferred_protocol: Protocol,

    /// Number of local gossip nodes hosted by this process. `None` means 1;
    /// an explicit 0 forces a node-less process (listener and registries
    /// only, useful for relay-style deployments).
    pub numnodes: Option<usize>,
}

impl Default for GossipSettings {
    fn default() -> Self {
        Self {
            eripa: None,
            all_known_addresses: Vec::new(),
            gossip_port: DEFAULT_GOSSIP_PORT,
            preferred_protocol: Protocol::default(),
            numnodes: None,
        }
    }
}

impl GossipSettings {
    /// Number of local nodes this process should host. `None` collapses to
    /// 1; an explicit 0 stays 0.
    pub fn node_count(&self) -> usize {
        self.numnodes.unwrap_or(1)
    }

    /// The port a co-tenant process on the same host should listen on.
    pub fn secondary_port(&self) -> u16 {
        self.gossip_port.wrapping_add(SECONDARY_PORT_OFFSET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_is_a_valid_configuration() {
        let settings: GossipSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.gossip_port, DEFAULT_GOSSIP_PORT);
        assert_eq!(settings.preferred_protocol, Protocol::Tcp);
        assert!(settings.eripa.is_none());
        assert!(settings.all_known_addresses.is_empty());
        assert_eq!(settings.node_count(), 1);
    }

    #[test]
    fn explicit_zero_nodes_stays_zero() {
        let settings: GossipSettings = serde_json::from_str(r#"{"numnodes": 0}"#).unwrap();
        assert_eq!(settings.node_count(), 0);
    }

    #[test]
    fn secondary_port_is_primary_plus_one() {
        let settings = GossipSettings {
            gossip_port: 9310,
            ..Default::default()
        };
        assert_eq!(settings.secondary_port(), 9311);
    }

    #[test]
    fn protocol_parses_uppercase() {
        let settings: GossipSettings =
            serde_json::from_str(r#"{"preferred_protocol": "UDP"}"#).unwrap();
        assert_eq!(settings.preferred_protocol, Protocol::Udp);
    }

    #[test]
    fn settings_round_trip() {
        let settings = GossipSettings {
            eripa: Some("203.0.113.7".parse().unwrap()),
            all_known_addresses: vec!["203.0.113.8:9310".parse().unwrap()],
            gossip_port: 9400,
            preferred_protocol: Protocol::Tcp,
            numnodes: Some(4),
        };
        let json = serde_json::to_string(&settings).unwrap();
        let back: GossipSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.gossip_port, 9400);
        assert_eq!(back.node_count(), 4);
        assert_eq!(back.eripa, settings.eripa);
    }

    #[test]
    fn timing_constants_sanity() {
        // The cache must outlive the forwarding window, or loop suppression
        // has a hole exactly when stragglers arrive.
        assert!(SEEN_GC_INTERVAL_MS < DEFAULT_TTL_SECONDS * 1000);
        assert!(CONNECT_TIMEOUT < MONITOR_IDLE_TIMEOUT);
    }
}
