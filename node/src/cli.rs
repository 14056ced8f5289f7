//! # CLI Interface
//!
//! Defines the command-line argument structure for `ember-node` using
//! `clap` derive. Three subcommands: `run`, `simulate`, and `version`.
//!
//! Every configurable value has a corresponding environment variable for
//! container-friendly deployment — because nobody wants to pass 12 flags
//! to a Docker entrypoint.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use ember_protocol::config::DEFAULT_MAX_DEGREE;

/// EMBER gossip fleet node.
///
/// Hosts one or more local gossip nodes, listens for peer connections,
/// and disseminates messages across the fleet graph.
#[derive(Parser, Debug)]
#[command(
    name = "ember-node",
    about = "EMBER gossip fleet node",
    version,
    propagate_version = true
)]
pub struct EmberNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the EMBER node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the gossip node process.
    Run(RunArgs),
    /// Build an in-process fleet and run the built-in solicitations
    /// against it — a smoke test for the propagation machinery.
    Simulate(SimulateArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to a JSON settings file. Flags override file values.
    #[arg(long, short = 's', env = "EMBER_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Externally routable address of this node. Omit to bind the
    /// unspecified address and auto-detect.
    #[arg(long, env = "EMBER_ERIPA")]
    pub eripa: Option<IpAddr>,

    /// Listening port for inbound gossip connections.
    #[arg(long, env = "EMBER_GOSSIP_PORT")]
    pub gossip_port: Option<u16>,

    /// Number of local gossip nodes hosted by this process.
    #[arg(long, env = "EMBER_NUMNODES")]
    pub numnodes: Option<usize>,

    /// Bootstrap peer address (host:port). Repeatable; the env form is
    /// comma-separated.
    #[arg(long = "peer", env = "EMBER_PEERS", value_delimiter = ',')]
    pub peers: Vec<SocketAddr>,

    /// Maximum neighbor degree when wiring co-tenant local nodes.
    #[arg(long, env = "EMBER_MAX_DEGREE", default_value_t = DEFAULT_MAX_DEGREE)]
    pub max_degree: usize,

    /// Topology seed for co-tenant wiring, for reproducible deployments.
    #[arg(long, env = "EMBER_TOPOLOGY_SEED", default_value_t = 0)]
    pub seed: u64,

    /// Log format: "pretty" or "json".
    #[arg(long, env = "EMBER_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `simulate` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of nodes in the simulated fleet.
    #[arg(long, short = 'n', default_value_t = 10)]
    pub nodes: usize,

    /// Maximum neighbor degree for the built topology.
    #[arg(long, short = 'd', default_value_t = DEFAULT_MAX_DEGREE)]
    pub degree: usize,

    /// Topology seed, so a run replays exactly.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}
