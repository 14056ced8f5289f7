//! # Socket Owner Actor
//!
//! Exclusive owner of one TCP stream. The owner thread consumes a mailbox
//! of commands; all socket I/O happens inside its handler, which is what
//! serializes access without a single mutex.
//!
//! Required precondition before decoding: readiness events and frames do
//! not correspond 1:1. The monitor may post several `ReceiveReady` events
//! for bytes a single drain already consumed, so the handler must probe
//! for at least one buffered byte before invoking the frame reader — an
//! unguarded read on an empty stream would park the actor until the peer
//! happens to send again.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::config::FRAME_IO_TIMEOUT;
use crate::message::Envelope;
use crate::wire::{read_frame, write_frame};

use super::monitor::spawn_monitor;
use super::registry::ConnectionRegistry;
use super::NetError;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Owner lifecycle: `Open → Closing → Closed`, one way only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerState {
    Open,
    Closing,
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

fn state_from(raw: u8) -> OwnerState {
    match raw {
        STATE_OPEN => OwnerState::Open,
        STATE_CLOSING => OwnerState::Closing,
        _ => OwnerState::Closed,
    }
}

/// Mailbox commands. `ReceiveReady` and the monitor's `Shutdown` come from
/// the readiness thread; `Send` and explicit `Shutdown` from anywhere.
pub(super) enum OwnerCommand {
    Send(Envelope),
    ReceiveReady,
    Shutdown,
}

/// One decoded frame, tagged with the peer it arrived from.
#[derive(Debug)]
pub struct InboundFrame {
    pub peer: SocketAddr,
    pub envelope: Envelope,
}

// ---------------------------------------------------------------------------
// SocketOwner
// ---------------------------------------------------------------------------

/// Handle to a socket owner actor.
///
/// The handle never touches the stream; it only enqueues commands. Once
/// the owner reaches `Closed`, every `send` fails with [`NetError::Closed`]
/// and the caller may obtain a fresh owner via `ensure_connection`.
#[derive(Debug)]
pub struct SocketOwner {
    peer: SocketAddr,
    cmd_tx: Sender<OwnerCommand>,
    state: Arc<AtomicU8>,
}

impl SocketOwner {
    /// Takes ownership of `stream`, spawning the owner thread and its
    /// readiness monitor. The caller is responsible for registering the
    /// returned handle in the connection registry.
    pub fn spawn(
        stream: TcpStream,
        peer: SocketAddr,
        outbox: Sender<InboundFrame>,
        registry: Arc<ConnectionRegistry>,
    ) -> io::Result<Arc<Self>> {
        stream.set_read_timeout(Some(FRAME_IO_TIMEOUT))?;
        stream.set_write_timeout(Some(FRAME_IO_TIMEOUT))?;

        let (cmd_tx, cmd_rx) = unbounded();
        let state = Arc::new(AtomicU8::new(STATE_OPEN));
        let stop = Arc::new(AtomicBool::new(false));
        let monitor = spawn_monitor(stream.try_clone()?, peer, cmd_tx.clone(), Arc::clone(&stop))?;

        let actor = OwnerActor {
            stream,
            peer,
            outbox,
            registry,
            state: Arc::clone(&state),
            stop,
            monitor: Some(monitor),
        };
        thread::Builder::new()
            .name(format!("socket-owner-{peer}"))
            .spawn(move || actor.run(cmd_rx))?;

        Ok(Arc::new(Self {
            peer,
            cmd_tx,
            state,
        }))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> OwnerState {
        state_from(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == OwnerState::Open
    }

    /// Enqueues one envelope for transmission.
    pub fn send(&self, envelope: Envelope) -> Result<(), NetError> {
        if !self.is_open() {
            return Err(NetError::Closed);
        }
        self.cmd_tx
            .send(OwnerCommand::Send(envelope))
            .map_err(|_| NetError::Closed)
    }

    /// Requests teardown. Idempotent: a second call observes the same
    /// closed state the first one produced.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(OwnerCommand::Shutdown);
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct OwnerActor {
    stream: TcpStream,
    peer: SocketAddr,
    outbox: Sender<InboundFrame>,
    registry: Arc<ConnectionRegistry>,
    state: Arc<AtomicU8>,
    stop: Arc<AtomicBool>,
    monitor: Option<JoinHandle<()>>,
}

/// Result of the buffered-byte probe that guards the frame reader.
enum Probe {
    Data,
    Empty,
    Eof,
    Failed(io::Error),
}

impl OwnerActor {
    fn run(mut self, cmd_rx: Receiver<OwnerCommand>) {
        debug!(peer = %self.peer, "socket owner started");
        loop {
            match cmd_rx.recv() {
                Ok(OwnerCommand::Send(envelope)) => {
                    if let Err(e) = write_frame(&mut self.stream, &envelope) {
                        warn!(peer = %self.peer, error = %e, "send failed, tearing down");
                        break;
                    }
                    trace!(peer = %self.peer, destination = %envelope.destination, "frame sent");
                }
                Ok(OwnerCommand::ReceiveReady) => {
                    if !self.drain_inbound() {
                        break;
                    }
                }
                Ok(OwnerCommand::Shutdown) | Err(_) => break,
            }
        }
        self.teardown();
    }

    /// Decodes every fully-buffered frame. Returns `false` once the
    /// connection is over (EOF, I/O failure, or an unsynchronized stream).
    fn drain_inbound(&mut self) -> bool {
        loop {
            match self.probe() {
                Probe::Empty => return true,
                Probe::Eof => {
                    debug!(peer = %self.peer, "peer closed the stream");
                    return false;
                }
                Probe::Failed(e) => {
                    warn!(peer = %self.peer, error = %e, "receive probe failed");
                    return false;
                }
                Probe::Data => match read_frame(&mut self.stream) {
                    Ok(Some(envelope)) => {
                        trace!(peer = %self.peer, destination = %envelope.destination, "frame received");
                        if self
                            .outbox
                            .send(InboundFrame {
                                peer: self.peer,
                                envelope,
                            })
                            .is_err()
                        {
                            debug!(peer = %self.peer, "outbox consumer gone");
                            return false;
                        }
                    }
                    Ok(None) => return false,
                    Err(e) => {
                        warn!(peer = %self.peer, error = %e, "frame decode failed, stream unsynchronized");
                        return false;
                    }
                },
            }
        }
    }

    /// Non-blocking peek for at least one buffered byte — the guard that
    /// keeps spurious readiness events from parking the actor in a read.
    fn probe(&self) -> Probe {
        if let Err(e) = self.stream.set_nonblocking(true) {
            return Probe::Failed(e);
        }
        let mut byte = [0u8; 1];
        let peeked = self.stream.peek(&mut byte);
        if let Err(e) = self.stream.set_nonblocking(false) {
            return Probe::Failed(e);
        }
        match peeked {
            Ok(0) => Probe::Eof,
            Ok(_) => Probe::Data,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Probe::Empty,
            Err(e) => Probe::Failed(e),
        }
    }

    /// Cooperative teardown: registry entry first, then the monitor, then
    /// the socket. The outbox is left alone — consumers may still read
    /// frames that were already delivered.
    fn teardown(&mut self) {
        self.state.store(STATE_CLOSING, Ordering::SeqCst);
        self.registry.remove(self.peer);
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.join();
        }
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        debug!(peer = %self.peer, "socket owner closed");
    }
}
