//! # Gossip Node Actor
//!
//! One thread, one mailbox, one [`GossipCore`]. The actor consumes events
//! serially, so every message is fully processed — admission, cache
//! update, forward enqueue — before the next one is looked at. That
//! ordering is the whole concurrency story for a node: the core needs no
//! locks because nothing else can reach it.
//!
//! The actor never blocks on the network. Forwards resolve the target
//! through the node registry per dispatch: local neighbors get an enqueue
//! on their own mailbox, remote neighbors go through their proxy. Reply
//! deadlines are handled by bounding the mailbox wait with the earliest
//! pending deadline instead of sleeping.
//!
//! [`NodeHandle`] is the outward face: fire-and-forget broadcast plus the
//! two solicitation variants. `solicit_wait` blocks the *calling* thread,
//! never the actor — do not call it from a verb handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::{NODE_IDLE_TICK_MS, SEEN_GC_INTERVAL_MS, SOLICIT_GRACE_MS};
use crate::gossip::{GossipAction, GossipConfig, GossipCore, GossipStats, ReplyAddress};
use crate::message::{unix_now_ms, Message, MessageId, Payload};
use crate::registry::{NodeEntry, NodeRegistry, NodeUid};
use crate::verbs::VerbRegistry;

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// Which solicitation variant to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolicitMode {
    /// Aggregate up the propagation tree.
    Wait,
    /// Every node answers the origin directly.
    Direct,
}

/// Result of a solicitation: the aggregate, and whether any wait-set was
/// still open when a deadline flushed it.
#[derive(Debug, Clone, PartialEq)]
pub struct SolicitOutcome {
    pub aggregate: Payload,
    pub partial: bool,
}

/// Solicitation failures surfaced to the caller.
#[derive(Debug, Error)]
pub enum SolicitError {
    /// No aggregate arrived, even past the deadline grace window.
    #[error("solicitation timed out without an aggregate")]
    Timeout,
    /// The node actor is shut down.
    #[error("node actor is not running")]
    NodeDown,
}

enum NodeEvent {
    Deliver {
        source: Option<NodeUid>,
        message: Message,
    },
    AddNeighbor(NodeUid),
    RemoveNeighbor(NodeUid),
    Broadcast {
        verb: String,
        payload: Payload,
    },
    Solicit {
        verb: String,
        payload: Payload,
        mode: SolicitMode,
        reply_tx: Sender<SolicitOutcome>,
    },
    QueryStats(Sender<GossipStats>),
    QueryNeighbors(Sender<Vec<NodeUid>>),
    Shutdown,
}

// ---------------------------------------------------------------------------
// NodeHandle
// ---------------------------------------------------------------------------

/// Mailbox handle to a local gossip node actor.
///
/// Cheap to share via `Arc`; the node registry hands these out. All
/// methods enqueue onto the actor's mailbox except the solicitation
/// variants, which additionally block the caller for the outcome.
pub struct NodeHandle {
    uid: NodeUid,
    tx: Sender<NodeEvent>,
    solicit_deadline_ms: u64,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl NodeHandle {
    pub fn uid(&self) -> NodeUid {
        self.uid
    }

    /// Delivers a message as if received from `source`. Returns `false`
    /// when the actor is gone.
    pub fn deliver(&self, source: Option<NodeUid>, message: Message) -> bool {
        self.tx
            .send(NodeEvent::Deliver { source, message })
            .is_ok()
    }

    /// Adds a neighbor edge to this node's neighbor set.
    pub fn add_neighbor(&self, uid: NodeUid) {
        let _ = self.tx.send(NodeEvent::AddNeighbor(uid));
    }

    pub fn remove_neighbor(&self, uid: NodeUid) {
        let _ = self.tx.send(NodeEvent::RemoveNeighbor(uid));
    }

    /// Injects a fire-and-forget command into the graph.
    pub fn broadcast(&self, verb: impl Into<String>, payload: Payload) {
        let _ = self.tx.send(NodeEvent::Broadcast {
            verb: verb.into(),
            payload,
        });
    }

    /// Injects a solicitation and blocks until the aggregate arrives or
    /// the deadline (plus a small grace window) passes.
    pub fn solicit_wait(
        &self,
        verb: impl Into<String>,
        payload: Payload,
    ) -> Result<SolicitOutcome, SolicitError> {
        self.solicit(verb.into(), payload, SolicitMode::Wait)
    }

    /// Like [`solicit_wait`](Self::solicit_wait), but asks every node to
    /// answer the origin directly instead of aggregating up the tree.
    pub fn solicit_direct(
        &self,
        verb: impl Into<String>,
        payload: Payload,
    ) -> Result<SolicitOutcome, SolicitError> {
        self.solicit(verb.into(), payload, SolicitMode::Direct)
    }

    fn solicit(
        &self,
        verb: String,
        payload: Payload,
        mode: SolicitMode,
    ) -> Result<SolicitOutcome, SolicitError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(NodeEvent::Solicit {
                verb,
                payload,
                mode,
                reply_tx,
            })
            .map_err(|_| SolicitError::NodeDown)?;

        let wait = Duration::from_millis(self.solicit_deadline_ms + SOLICIT_GRACE_MS);
        reply_rx.recv_timeout(wait).map_err(|_| SolicitError::Timeout)
    }

    /// Snapshot of the node's propagation counters.
    pub fn stats(&self) -> Option<GossipStats> {
        let (tx, rx) = bounded(1);
        self.tx.send(NodeEvent::QueryStats(tx)).ok()?;
        rx.recv_timeout(Duration::from_secs(1)).ok()
    }

    /// Snapshot of the node's neighbor set.
    pub fn neighbors(&self) -> Vec<NodeUid> {
        let (tx, rx) = bounded(1);
        if self.tx.send(NodeEvent::QueryNeighbors(tx)).is_err() {
            return Vec::new();
        }
        rx.recv_timeout(Duration::from_secs(1)).unwrap_or_default()
    }

    /// Stops the actor and joins its thread. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(NodeEvent::Shutdown);
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// Constructor for local gossip node actors.
pub struct LocalNode;

impl LocalNode {
    /// Allocates a UID, spawns the actor thread, and registers the handle.
    pub fn spawn(
        nodes: &Arc<NodeRegistry>,
        verbs: Arc<VerbRegistry>,
        config: GossipConfig,
    ) -> Arc<NodeHandle> {
        let uid = nodes.allocate_uid();
        let solicit_deadline_ms = config.solicit_deadline_ms;
        let (tx, rx) = unbounded();
        let core = GossipCore::new(uid, verbs, config);
        let registry = Arc::clone(nodes);
        let join = thread::Builder::new()
            .name(format!("gossip-node-{uid}"))
            .spawn(move || run_node_loop(core, rx, registry))
            .expect("spawn gossip node thread");

        let handle = Arc::new(NodeHandle {
            uid,
            tx,
            solicit_deadline_ms,
            join: Mutex::new(Some(join)),
        });
        nodes.register_local(Arc::clone(&handle));
        handle
    }
}

// ---------------------------------------------------------------------------
// Actor loop
// ---------------------------------------------------------------------------

fn run_node_loop(mut core: GossipCore, rx: Receiver<NodeEvent>, nodes: Arc<NodeRegistry>) {
    let mut waiters: HashMap<MessageId, Sender<SolicitOutcome>> = HashMap::new();
    let mut last_sweep = unix_now_ms();
    debug!(node = %core.uid(), "node actor started");

    loop {
        let now = unix_now_ms();
        let until_deadline = core
            .next_deadline_ms()
            .map(|at| at.saturating_sub(now))
            .unwrap_or(NODE_IDLE_TICK_MS);
        let timeout = until_deadline.clamp(1, NODE_IDLE_TICK_MS);

        match rx.recv_timeout(Duration::from_millis(timeout)) {
            Ok(event) => {
                let now = unix_now_ms();
                match event {
                    NodeEvent::Deliver { source, message } => {
                        let actions = core.admit(source, message, now);
                        execute(&core, &nodes, &mut waiters, actions);
                    }
                    NodeEvent::AddNeighbor(uid) => {
                        core.add_neighbor(uid);
                    }
                    NodeEvent::RemoveNeighbor(uid) => {
                        core.remove_neighbor(uid);
                    }
                    NodeEvent::Broadcast { verb, payload } => {
                        let msg = Message::command(
                            verb,
                            core.uid(),
                            core.config().ttl_seconds,
                            payload,
                            now / 1000,
                        );
                        let actions = core.admit(None, msg, now);
                        execute(&core, &nodes, &mut waiters, actions);
                    }
                    NodeEvent::Solicit {
                        verb,
                        payload,
                        mode,
                        reply_tx,
                    } => {
                        let msg = Message::solicit(
                            verb,
                            core.uid(),
                            core.config().ttl_seconds,
                            payload,
                            mode == SolicitMode::Direct,
                            now / 1000,
                        );
                        waiters.insert(msg.id, reply_tx);
                        let actions = core.admit(None, msg, now);
                        execute(&core, &nodes, &mut waiters, actions);
                    }
                    NodeEvent::QueryStats(tx) => {
                        let _ = tx.send(core.stats().clone());
                    }
                    NodeEvent::QueryNeighbors(tx) => {
                        let _ = tx.send(core.neighbors());
                    }
                    NodeEvent::Shutdown => break,
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = unix_now_ms();
        let due = core.expire_due(now);
        if !due.is_empty() {
            execute(&core, &nodes, &mut waiters, due);
        }
        if now.saturating_sub(last_sweep) >= SEEN_GC_INTERVAL_MS {
            core.evict_expired(now);
            last_sweep = now;
        }
    }

    debug!(node = %core.uid(), "node actor stopped");
}

fn execute(
    core: &GossipCore,
    nodes: &Arc<NodeRegistry>,
    waiters: &mut HashMap<MessageId, Sender<SolicitOutcome>>,
    actions: Vec<GossipAction>,
) {
    let self_uid = core.uid();
    for action in actions {
        match action {
            GossipAction::Forward { message, targets } => {
                for target in targets {
                    dispatch(nodes, self_uid, target, &message);
                }
            }
            GossipAction::SendReply { to, message } => {
                let target = match to {
                    ReplyAddress::Neighbor(uid) => uid,
                    ReplyAddress::Origin { origin, fallback } => {
                        if nodes.contains(origin) {
                            origin
                        } else {
                            trace!(node = %self_uid, %origin, "origin not resolvable, replying up-tree");
                            fallback
                        }
                    }
                };
                dispatch(nodes, self_uid, target, &message);
            }
            GossipAction::CallerReply {
                solicitation,
                aggregate,
                partial,
            } => {
                if let Some(tx) = waiters.remove(&solicitation) {
                    let _ = tx.send(SolicitOutcome { aggregate, partial });
                }
            }
            GossipAction::Drop { reason } => {
                trace!(node = %self_uid, ?reason, "message dropped");
            }
        }
    }
}

fn dispatch(nodes: &Arc<NodeRegistry>, from: NodeUid, target: NodeUid, message: &Message) {
    match nodes.get(target) {
        Some(NodeEntry::Local(handle)) => {
            if !handle.deliver(Some(from), message.clone()) {
                warn!(node = %from, %target, "local neighbor actor is gone");
            }
        }
        Some(NodeEntry::Proxy(proxy)) => {
            if let Err(e) = proxy.forward(message) {
                warn!(node = %from, %target, error = %e, "proxy forward failed");
            }
        }
        None => {
            warn!(node = %from, %target, "neighbor not in registry, dropping forward");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use crate::message::VERB_COUNT_ALIVE;
    use crate::registry::UidRegime;
    use crate::verbs::{NodeView, VerbHandler};

    fn fast_config() -> GossipConfig {
        GossipConfig {
            ttl_seconds: 30,
            solicit_deadline_ms: 400,
        }
    }

    fn fleet(n: usize) -> (Arc<NodeRegistry>, Vec<Arc<NodeHandle>>, Arc<VerbRegistry>) {
        let nodes = NodeRegistry::new(UidRegime::Tiny);
        let verbs = VerbRegistry::with_builtins();
        let handles: Vec<_> = (0..n)
            .map(|_| LocalNode::spawn(&nodes, Arc::clone(&verbs), fast_config()))
            .collect();
        (nodes, handles, verbs)
    }

    fn wire(handles: &[Arc<NodeHandle>], edges: &[(usize, usize)]) {
        for &(a, b) in edges {
            handles[a].add_neighbor(handles[b].uid());
            handles[b].add_neighbor(handles[a].uid());
        }
    }

    /// Polls until `check` passes or two seconds elapse.
    fn eventually(check: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
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

    #[test]
    fn broadcast_reaches_every_actor_exactly_once() {
        let (nodes, handles, verbs) = fleet(3);
        wire(&handles, &[(0, 1), (1, 2), (0, 2)]);

        let tally = Arc::new(Tally(AtomicUsize::new(0)));
        verbs.register("tally", Arc::clone(&tally) as Arc<dyn VerbHandler>);

        handles[0].broadcast("tally", Payload::None);
        assert!(eventually(|| tally.0.load(Ordering::SeqCst) == 3));

        // Settle, then confirm nobody fired twice.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(tally.0.load(Ordering::SeqCst), 3);
        nodes.clear();
    }

    #[test]
    fn solicit_wait_counts_the_chain() {
        let (nodes, handles, _verbs) = fleet(3);
        wire(&handles, &[(0, 1), (1, 2)]);

        let outcome = handles[0]
            .solicit_wait(VERB_COUNT_ALIVE, Payload::None)
            .expect("aggregate");
        assert_eq!(outcome.aggregate, Payload::Count(3));
        assert!(!outcome.partial);
        nodes.clear();
    }

    #[test]
    fn solicit_wait_returns_partial_when_a_neighbor_is_missing() {
        let (nodes, handles, _verbs) = fleet(1);
        // Neighbor UID that resolves to nothing: the forward is dropped and
        // the wait-set can only drain via the deadline.
        handles[0].add_neighbor(NodeUid(99));

        let outcome = handles[0]
            .solicit_wait(VERB_COUNT_ALIVE, Payload::None)
            .expect("partial aggregate");
        assert_eq!(outcome.aggregate, Payload::Count(1));
        assert!(outcome.partial);
        nodes.clear();
    }

    #[test]
    fn solicit_direct_collects_at_the_origin() {
        let (nodes, handles, _verbs) = fleet(3);
        wire(&handles, &[(0, 1), (1, 2)]);

        let outcome = handles[0]
            .solicit_direct(VERB_COUNT_ALIVE, Payload::None)
            .expect("aggregate");
        assert_eq!(outcome.aggregate, Payload::Count(3));
        assert!(!outcome.partial);
        nodes.clear();
    }

    #[test]
    fn stats_reflect_admissions() {
        let (nodes, handles, _verbs) = fleet(2);
        wire(&handles, &[(0, 1)]);

        handles[0].broadcast(VERB_COUNT_ALIVE, Payload::None);
        assert!(eventually(|| handles[1]
            .stats()
            .is_some_and(|s| s.admitted == 1)));
        nodes.clear();
    }

    #[test]
    fn shutdown_is_idempotent_and_solicit_fails_after() {
        let (nodes, handles, _verbs) = fleet(1);
        let handle = Arc::clone(&handles[0]);
        handle.shutdown();
        handle.shutdown();

        let err = handle
            .solicit_wait(VERB_COUNT_ALIVE, Payload::None)
            .unwrap_err();
        assert!(matches!(err, SolicitError::NodeDown));
        nodes.clear();
    }

    #[test]
    fn registry_clear_joins_every_actor() {
        let (nodes, handles, _verbs) = fleet(4);
        assert_eq!(nodes.len(), 4);
        nodes.clear();
        assert!(nodes.is_empty());
        assert!(!handles[0].deliver(
            None,
            Message::command(VERB_COUNT_ALIVE, NodeUid(9), 10, Payload::None, 0)
        ));
    }
}
