// Copyright (c) 2026 Emberwire Labs. MIT License.
// See LICENSE for details.

//! # EMBER Fleet Node
//!
//! Entry point for the `ember-node` binary. Parses CLI arguments,
//! initializes logging, brings up the fleet runtime, and serves gossip
//! until the process is stopped.
//!
//! The binary supports three subcommands:
//!
//! - `run`      — host local gossip nodes and listen for peers
//! - `simulate` — in-process fleet smoke test with the built-in verbs
//! - `version`  — print build version information

mod cli;
mod logging;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;

use ember_protocol::config::GossipSettings;
use ember_protocol::message::{Payload, VERB_COUNT_ALIVE, VERB_LIST_ALIVE};
use ember_protocol::registry::{NodeUid, UidRegime};
use ember_protocol::runtime::Fleet;

use cli::{Commands, EmberNodeCli, RunArgs, SimulateArgs};
use logging::LogFormat;

fn main() -> Result<()> {
    let cli = EmberNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args),
        Commands::Simulate(args) => simulate(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the full gossip node: local node actors, listener, bootstrap
/// peer connections.
fn run_node(args: RunArgs) -> Result<()> {
    logging::init_logging(
        "ember_node=info,ember_protocol=info",
        LogFormat::from_str_lossy(&args.log_format),
    );

    let settings = load_settings(&args)?;
    tracing::info!(
        gossip_port = settings.gossip_port,
        nodes = settings.node_count(),
        peers = settings.all_known_addresses.len(),
        "starting ember-node"
    );

    let fleet = Fleet::new(settings.clone())?;
    let handles = fleet.spawn_nodes(settings.node_count());
    if handles.len() > 1 {
        let edges = fleet.build_graph(args.max_degree, args.seed)?;
        tracing::info!(nodes = handles.len(), edges, "co-tenant nodes wired");
    }

    let addr = fleet.start_listener()?;
    tracing::info!(%addr, "listening for gossip peers");

    // Bootstrap: one anonymous proxy per known address, neighboring every
    // local node, so the first broadcast can leave the building.
    for peer in &settings.all_known_addresses {
        match fleet.add_peer(*peer, NodeUid::ANONYMOUS) {
            Ok(proxy) => {
                for handle in &handles {
                    handle.add_neighbor(proxy.uid());
                }
                tracing::info!(%peer, "bootstrap peer connected");
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "bootstrap peer unavailable");
            }
        }
    }

    // Serve until the process is stopped externally.
    loop {
        std::thread::park();
    }
}

/// Merges the settings file (if any) with flag overrides.
fn load_settings(args: &RunArgs) -> Result<GossipSettings> {
    let mut settings = match &args.settings {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read settings file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("failed to parse settings file {}", path.display()))?
        }
        None => GossipSettings::default(),
    };

    if let Some(ip) = args.eripa {
        settings.eripa = Some(ip);
    }
    if let Some(port) = args.gossip_port {
        settings.gossip_port = port;
    }
    if let Some(n) = args.numnodes {
        settings.numnodes = Some(n);
    }
    if !args.peers.is_empty() {
        settings.all_known_addresses = args.peers.clone();
    }
    Ok(settings)
}

/// Builds an in-process fleet and runs the built-in solicitations over it.
fn simulate(args: SimulateArgs) -> Result<()> {
    logging::init_logging("ember_node=info,ember_protocol=warn", LogFormat::Pretty);

    let settings = GossipSettings {
        eripa: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        gossip_port: 0,
        ..Default::default()
    };
    let fleet = Fleet::new(settings)?;
    fleet.set_uid_regime(UidRegime::Tiny);

    let handles = fleet.spawn_nodes(args.nodes);
    let edges = fleet.build_graph(args.degree, args.seed)?;
    println!(
        "fleet: {} nodes, {} edges, max degree {}, seed {}",
        args.nodes, edges, args.degree, args.seed
    );

    let origin = handles.first().context("simulation needs at least one node")?;

    let started = Instant::now();
    let count = origin
        .solicit_wait(VERB_COUNT_ALIVE, Payload::None)
        .map_err(|e| anyhow::anyhow!("count-alive failed: {e}"))?;
    println!(
        "count-alive from node {}: {:?} (partial: {}) in {:.1?}",
        origin.uid(),
        count.aggregate,
        count.partial,
        started.elapsed()
    );

    let started = Instant::now();
    let list = origin
        .solicit_wait(VERB_LIST_ALIVE, Payload::None)
        .map_err(|e| anyhow::anyhow!("list-alive failed: {e}"))?;
    match list.aggregate {
        Payload::UidList(uids) => println!(
            "list-alive from node {}: {} uids (partial: {}) in {:.1?}",
            origin.uid(),
            uids.len(),
            list.partial,
            started.elapsed()
        ),
        other => println!("list-alive returned unexpected payload: {other:?}"),
    }

    fleet.shutdown();
    Ok(())
}

fn print_version() {
    println!("ember-node {}", env!("CARGO_PKG_VERSION"));
}
