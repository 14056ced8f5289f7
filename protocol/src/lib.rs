// Copyright (c) 2026 Emberwire Labs. MIT License.
// See LICENSE for details.

//! # EMBER Protocol — Gossip Dissemination Core
//!
//! EMBER moves messages across a small blockchain node fleet the way a fire
//! moves across dry grass: inject once anywhere, and every reachable node
//! sees it within a handful of rounds. No coordinator, no broker, no
//! message queue with a nine-figure license — just a bounded-degree graph
//! of peers flooding to their neighbors and a cache that keeps the flood
//! from looping forever.
//!
//! ## Architecture
//!
//! The crate splits along the actual concerns of a gossip fleet:
//!
//! - **message** — the immutable gossip record: identity, TTL, verbs, payloads.
//! - **gossip** — the propagation state machine. Admission bands, the seen
//!   cache, neighbor exclusion, and reply aggregation. Pure: it returns
//!   actions, it never touches a socket.
//! - **node** — the actor shell that owns one `GossipCore` and executes its
//!   actions. The solicitation API lives on its handle.
//! - **verbs** — the registration table mapping verb names to handlers.
//! - **registry** — the process-wide node registry and UID allocation.
//! - **proxy** — local stand-ins for remote nodes; forwards over the wire.
//! - **graph** — seeded construction of connected, bounded-degree topologies.
//! - **wire** — length-prefixed bincode framing for the TCP stream.
//! - **net** — socket ownership: one actor per stream, one readiness
//!   monitor thread per actor, and the connection registry.
//! - **runtime** — the fleet supervisor: listeners, routers, admin surface.
//! - **config** — constants and the node settings bag.
//!
//! ## Design Philosophy
//!
//! 1. Exactly one owner per socket. Mailbox ordering replaces mutexes.
//! 2. Duplicate delivery is benign; the seen cache makes it so.
//! 3. Partial answers beat thrown exceptions. Deadlines always resolve.
//! 4. The propagation core is deterministic under an injected clock —
//!    every TTL scenario is testable without a single `sleep`.

pub mod config;
pub mod gossip;
pub mod graph;
pub mod message;
pub mod net;
pub mod node;
pub mod proxy;
pub mod registry;
pub mod runtime;
pub mod verbs;
pub mod wire;
