//! # Socket Ownership Layer
//!
//! Per-socket serialization without explicit locks. Every TCP stream has
//! exactly one [`SocketOwner`] — a thread serving a mailbox of commands —
//! and all reads and writes happen inside its handler. A dedicated
//! readiness monitor thread blocks on the socket's file descriptor and
//! posts `RECEIVE_READY` / `SHUTDOWN` into that mailbox, so the owner
//! itself never waits on the network.
//!
//! The [`ConnectionRegistry`] deduplicates owners per peer endpoint:
//! concurrent dials race on a lock and the losers adopt the winner's
//! owner. Teardown removes the registry entry *before* the socket is
//! released, so a later `ensure_connection` can never observe a half-dead
//! owner.

mod listener;
mod monitor;
mod owner;
mod registry;

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

pub use listener::{spawn_router, GossipListener};
pub use owner::{InboundFrame, OwnerState, SocketOwner};
pub use registry::ConnectionRegistry;

/// Socket-layer failures surfaced to callers.
#[derive(Debug, Error)]
pub enum NetError {
    /// TCP connect refused, timed out, or the address is unusable.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] io::Error),

    /// Operation on an owner that already terminated. Retry via
    /// `ensure_connection` obtains a fresh one.
    #[error("socket owner is closed")]
    Closed,

    /// A live owner is already registered for this endpoint.
    #[error("connection to {0} already registered")]
    DuplicateConnection(SocketAddr),

    /// The listener could not bind or inspect its socket.
    #[error("listener bind failed: {0}")]
    Bind(#[source] io::Error),
}
