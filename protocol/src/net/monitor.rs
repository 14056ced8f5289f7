//! # Readiness Monitor
//!
//! One dedicated OS thread per socket owner. Its only job is to block on
//! the socket's file descriptor and translate kernel readiness into
//! mailbox commands: readable → `ReceiveReady`, hangup → `Shutdown`, a
//! full idle window with nothing at all → `Shutdown` (peer presumed to
//! have closed cleanly). Any other poll error is logged and the loop
//! continues.
//!
//! The monitor holds a duplicated handle registered for readiness only.
//! It never reads or writes — every byte of data I/O stays inside the
//! owner's handler, which is what keeps the ownership invariant intact.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::Sender;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, trace, warn};

use crate::config::MONITOR_IDLE_TIMEOUT;

use super::owner::OwnerCommand;

const SOCKET: Token = Token(0);

pub(super) fn spawn_monitor(
    stream: TcpStream,
    peer: SocketAddr,
    commands: Sender<OwnerCommand>,
    stop: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("readiness-{peer}"))
        .spawn(move || run_monitor(stream, peer, commands, stop))
}

fn run_monitor(
    stream: TcpStream,
    peer: SocketAddr,
    commands: Sender<OwnerCommand>,
    stop: Arc<AtomicBool>,
) {
    let mut poll = match Poll::new() {
        Ok(poll) => poll,
        Err(e) => {
            warn!(%peer, error = %e, "readiness poll unavailable");
            let _ = commands.send(OwnerCommand::Shutdown);
            return;
        }
    };

    let mut source = mio::net::TcpStream::from_std(stream);
    if let Err(e) = poll
        .registry()
        .register(&mut source, SOCKET, Interest::READABLE)
    {
        warn!(%peer, error = %e, "readiness registration failed");
        let _ = commands.send(OwnerCommand::Shutdown);
        return;
    }

    let mut events = Events::with_capacity(4);
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        match poll.poll(&mut events, Some(MONITOR_IDLE_TIMEOUT)) {
            Ok(()) => {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                if events.is_empty() {
                    debug!(%peer, "idle window elapsed, presuming peer closed");
                    let _ = commands.send(OwnerCommand::Shutdown);
                    return;
                }
                for event in events.iter() {
                    // Readable first: a peer that sends a final frame and
                    // closes raises both bits, and the owner must get its
                    // chance to drain before teardown.
                    if event.is_readable() && commands.send(OwnerCommand::ReceiveReady).is_err() {
                        return;
                    }
                    if event.is_read_closed() || event.is_error() {
                        trace!(%peer, "hangup observed");
                        let _ = commands.send(OwnerCommand::Shutdown);
                        return;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(%peer, error = %e, "readiness poll error");
                continue;
            }
        }
    }
}
