//! # Gossip Propagation Core
//!
//! Epidemic-style message propagation for the EMBER fleet. When a node
//! admits a new message it forwards the message to every neighbor except
//! the one it arrived from; each neighbor does the same, so a message
//! injected anywhere reaches every connected node in O(diameter) rounds.
//!
//! ## Deduplication
//!
//! Every message carries a globally unique id. Nodes keep a seen cache
//! keyed by id; a message whose id is already cached is dropped instead of
//! being re-forwarded. This is the loop-suppression mechanism — rings and
//! diamonds in the graph produce duplicate deliveries, and the cache makes
//! every duplicate benign.
//!
//! ## TTL bands
//!
//! Admission classifies a message against its absolute expiry. Fresh
//! messages are admitted. Messages inside one extra TTL past expiry are
//! dropped without touching the cache, so a straggler cannot resurrect an
//! id that is still being suppressed. Messages beyond that band evict any
//! cache entry on their way out, which bounds the cache: every entry is
//! gone within two TTLs of the original timestamp, swept by
//! [`GossipCore::evict_expired`] whether or not the id is ever re-presented.
//!
//! ## Purity
//!
//! The core performs no I/O and reads no clock. Admission takes `now_ms`
//! explicitly and returns [`GossipAction`] values for the actor shell to
//! execute. Every TTL and deadline scenario is testable as a plain state
//! machine.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::{DEFAULT_SOLICIT_DEADLINE_MS, DEFAULT_TTL_SECONDS};
use crate::message::{ExpiryBand, Message, MessageId, MessageKind, Payload};
use crate::registry::NodeUid;
use crate::verbs::{NodeView, VerbRegistry};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-node propagation tuning.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// TTL stamped on messages this node originates.
    pub ttl_seconds: u64,
    /// How long a solicitation waits for downstream replies before the
    /// partial aggregate is flushed upstream.
    pub solicit_deadline_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_TTL_SECONDS,
            solicit_deadline_ms: DEFAULT_SOLICIT_DEADLINE_MS,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Propagation counters, monotonic over the node's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GossipStats {
    /// Messages admitted (verb executed, cache entry created).
    pub admitted: u64,
    /// Duplicates suppressed by the seen cache.
    pub duplicates: u64,
    /// Messages dropped in the soft-expiry band.
    pub soft_expired: u64,
    /// Messages dropped past the hard-expiry bound.
    pub hard_expired: u64,
    /// Per-neighbor forwards enqueued.
    pub forwarded: u64,
    /// Downstream replies folded into aggregates.
    pub replies_folded: u64,
    /// Cache entries removed by the TTL sweep.
    pub evicted: u64,
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Where a point-to-point reply should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyAddress {
    /// The neighbor the solicitation arrived from.
    Neighbor(NodeUid),
    /// Straight to the solicitation's origin (direct-reply mode), falling
    /// back to the arrival neighbor when the origin is not resolvable.
    Origin { origin: NodeUid, fallback: NodeUid },
}

/// Why a message was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Duplicate,
    SoftExpired,
    HardExpired,
    UnknownVerb,
    StrayReply,
}

/// What the actor shell should do after the core processed one message.
///
/// The core never touches a socket or a mailbox; it describes the work and
/// the shell dispatches it against the registries.
#[derive(Debug, Clone)]
pub enum GossipAction {
    /// Enqueue the message to each target neighbor.
    Forward {
        message: Message,
        targets: Vec<NodeUid>,
    },
    /// Send one reply point-to-point.
    SendReply {
        to: ReplyAddress,
        message: Message,
    },
    /// Resolve a locally-originated solicitation with its aggregate.
    CallerReply {
        solicitation: MessageId,
        aggregate: Payload,
        partial: bool,
    },
    /// The message was dropped; nothing to dispatch.
    Drop { reason: DropReason },
}

// ---------------------------------------------------------------------------
// Cache bookkeeping
// ---------------------------------------------------------------------------

/// Where the aggregate goes once this node's wait-set drains.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplyRoute {
    /// This node originated the solicitation; resolve the caller.
    Caller,
    /// Forward the aggregate to the neighbor the solicitation came from.
    Upstream(NodeUid),
}

/// Active reply aggregation for one solicitation.
#[derive(Debug)]
struct ReplyState {
    verb: String,
    outstanding: HashSet<NodeUid>,
    aggregate: Payload,
    partial: bool,
    deadline_at_ms: u64,
    route: ReplyRoute,
    /// Direct-reply collection slot at the origin: the population is
    /// unknown, so only the deadline closes it.
    direct: bool,
}

/// One seen-cache entry.
#[derive(Debug)]
struct SeenEntry {
    #[allow(dead_code)]
    first_seen_at_ms: u64,
    #[allow(dead_code)]
    source: Option<NodeUid>,
    /// Unix second after which the sweep removes this entry.
    hard_expiry_secs: u64,
    reply: Option<ReplyState>,
}

// ---------------------------------------------------------------------------
// GossipCore
// ---------------------------------------------------------------------------

/// The propagation state machine for one gossip node.
///
/// Owned exclusively by the node's actor thread; no interior locking.
pub struct GossipCore {
    uid: NodeUid,
    neighbors: HashSet<NodeUid>,
    seen: HashMap<MessageId, SeenEntry>,
    verbs: Arc<VerbRegistry>,
    config: GossipConfig,
    stats: GossipStats,
}

impl GossipCore {
    pub fn new(uid: NodeUid, verbs: Arc<VerbRegistry>, config: GossipConfig) -> Self {
        Self {
            uid,
            neighbors: HashSet::new(),
            seen: HashMap::new(),
            verbs,
            config,
            stats: GossipStats::default(),
        }
    }

    pub fn uid(&self) -> NodeUid {
        self.uid
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    pub fn stats(&self) -> &GossipStats {
        &self.stats
    }

    /// Adds a neighbor edge. Self-edges and duplicates are rejected.
    pub fn add_neighbor(&mut self, uid: NodeUid) -> bool {
        if uid == self.uid {
            return false;
        }
        self.neighbors.insert(uid)
    }

    pub fn remove_neighbor(&mut self, uid: NodeUid) -> bool {
        self.neighbors.remove(&uid)
    }

    pub fn neighbors(&self) -> Vec<NodeUid> {
        self.neighbors.iter().copied().collect()
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }

    pub fn seen_contains(&self, id: MessageId) -> bool {
        self.seen.contains_key(&id)
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    fn view(&self) -> NodeView {
        NodeView {
            uid: self.uid,
            neighbor_count: self.neighbors.len(),
        }
    }

    // -- Admission ----------------------------------------------------------

    /// Processes one message arriving from `source` (`None` for the local
    /// API) at clock `now_ms`, per the admission rules.
    pub fn admit(
        &mut self,
        source: Option<NodeUid>,
        message: Message,
        now_ms: u64,
    ) -> Vec<GossipAction> {
        let now_secs = now_ms / 1000;

        match message.expiry_band(now_secs) {
            ExpiryBand::HardExpired => {
                if self.seen.remove(&message.id).is_some() {
                    debug!(node = %self.uid, id = %message.id, "hard-expired message evicted its cache entry");
                }
                self.stats.hard_expired += 1;
                return vec![GossipAction::Drop {
                    reason: DropReason::HardExpired,
                }];
            }
            ExpiryBand::SoftExpired => {
                trace!(node = %self.uid, id = %message.id, "dropping soft-expired message");
                self.stats.soft_expired += 1;
                return vec![GossipAction::Drop {
                    reason: DropReason::SoftExpired,
                }];
            }
            ExpiryBand::Fresh => {}
        }

        if message.kind == MessageKind::Reply {
            return self.fold_reply(source, message, now_ms);
        }

        if self.seen.contains_key(&message.id) {
            trace!(node = %self.uid, id = %message.id, "suppressing duplicate");
            self.stats.duplicates += 1;
            let mut actions = vec![GossipAction::Drop {
                reason: DropReason::Duplicate,
            }];
            // A duplicate solicitation still owes its sender an answer:
            // the sender put us in its wait-set when it forwarded. An
            // empty contribution drains that slot without double-counting.
            if message.kind == MessageKind::Solicit && !message.direct_reply {
                if let Some(sender) = source {
                    actions.push(GossipAction::SendReply {
                        to: ReplyAddress::Neighbor(sender),
                        message: Message::reply_to(
                            message.id,
                            message.verb.as_str(),
                            self.uid,
                            self.config.ttl_seconds,
                            Payload::None,
                            false,
                            now_secs,
                        ),
                    });
                }
            }
            return actions;
        }

        let Some(handler) = self.verbs.get(&message.verb) else {
            warn!(node = %self.uid, verb = %message.verb, "unknown verb, dropping");
            self.seen.insert(
                message.id,
                SeenEntry {
                    first_seen_at_ms: now_ms,
                    source,
                    hard_expiry_secs: message.hard_expiry(),
                    reply: None,
                },
            );
            return vec![GossipAction::Drop {
                reason: DropReason::UnknownVerb,
            }];
        };

        let contribution = handler.apply(&self.view(), &message);
        let targets: Vec<NodeUid> = self
            .neighbors
            .iter()
            .copied()
            .filter(|n| Some(*n) != source)
            .collect();

        self.stats.admitted += 1;
        let mut actions = Vec::new();
        let mut reply_state = None;

        match message.kind {
            MessageKind::Command => {}
            MessageKind::Solicit => {
                let local = contribution.unwrap_or(Payload::None);
                if message.direct_reply {
                    match source {
                        Some(sender) => {
                            // Intermediate node: answer the origin directly,
                            // keep no wait-set.
                            actions.push(GossipAction::SendReply {
                                to: ReplyAddress::Origin {
                                    origin: message.origin_uid,
                                    fallback: sender,
                                },
                                message: Message::reply_to(
                                    message.id,
                                    message.verb.as_str(),
                                    self.uid,
                                    self.config.ttl_seconds,
                                    local,
                                    false,
                                    now_secs,
                                ),
                            });
                        }
                        None if targets.is_empty() => {
                            // Origin with no neighbors: nobody else can answer.
                            actions.push(GossipAction::CallerReply {
                                solicitation: message.id,
                                aggregate: local,
                                partial: false,
                            });
                        }
                        None => {
                            // Origin: collect direct replies until the deadline.
                            reply_state = Some(ReplyState {
                                verb: message.verb.clone(),
                                outstanding: HashSet::new(),
                                aggregate: local,
                                partial: false,
                                deadline_at_ms: now_ms + self.config.solicit_deadline_ms,
                                route: ReplyRoute::Caller,
                                direct: true,
                            });
                        }
                    }
                } else if targets.is_empty() {
                    // Leaf of the propagation tree: answer immediately.
                    match source {
                        Some(sender) => actions.push(GossipAction::SendReply {
                            to: ReplyAddress::Neighbor(sender),
                            message: Message::reply_to(
                                message.id,
                                message.verb.as_str(),
                                self.uid,
                                self.config.ttl_seconds,
                                local,
                                false,
                                now_secs,
                            ),
                        }),
                        None => actions.push(GossipAction::CallerReply {
                            solicitation: message.id,
                            aggregate: local,
                            partial: false,
                        }),
                    }
                } else {
                    // Intermediate slots flush earlier than the origin's so
                    // a partial aggregate still reaches the caller before it
                    // gives up on its own deadline.
                    let deadline_at_ms = match source {
                        Some(_) => now_ms + self.config.solicit_deadline_ms * 3 / 4,
                        None => now_ms + self.config.solicit_deadline_ms,
                    };
                    reply_state = Some(ReplyState {
                        verb: message.verb.clone(),
                        outstanding: targets.iter().copied().collect(),
                        aggregate: local,
                        partial: false,
                        deadline_at_ms,
                        route: match source {
                            Some(sender) => ReplyRoute::Upstream(sender),
                            None => ReplyRoute::Caller,
                        },
                        direct: false,
                    });
                }
            }
            MessageKind::Reply => unreachable!("replies are folded above"),
        }

        self.seen.insert(
            message.id,
            SeenEntry {
                first_seen_at_ms: now_ms,
                source,
                hard_expiry_secs: message.hard_expiry(),
                reply: reply_state,
            },
        );

        if !targets.is_empty() {
            self.stats.forwarded += targets.len() as u64;
            actions.push(GossipAction::Forward { message, targets });
        }

        actions
    }

    // -- Reply aggregation --------------------------------------------------

    fn fold_reply(
        &mut self,
        source: Option<NodeUid>,
        reply: Message,
        now_ms: u64,
    ) -> Vec<GossipAction> {
        let Some(solicitation_id) = reply.solicitation_id else {
            warn!(node = %self.uid, id = %reply.id, "reply without solicitation id, dropping");
            return vec![GossipAction::Drop {
                reason: DropReason::StrayReply,
            }];
        };

        let Some(handler) = self.verbs.get(&reply.verb) else {
            warn!(node = %self.uid, verb = %reply.verb, "reply for unknown verb, dropping");
            return vec![GossipAction::Drop {
                reason: DropReason::UnknownVerb,
            }];
        };

        let replier = source.unwrap_or(reply.origin_uid);
        let Some(state) = self
            .seen
            .get_mut(&solicitation_id)
            .and_then(|entry| entry.reply.as_mut())
        else {
            // Late reply after the slot was flushed, or a solicitation we
            // never saw. Either way the aggregate has already moved on.
            trace!(node = %self.uid, solicitation = %solicitation_id, "stray reply, dropping");
            return vec![GossipAction::Drop {
                reason: DropReason::StrayReply,
            }];
        };

        let acc = mem::replace(&mut state.aggregate, Payload::None);
        state.aggregate = handler.fold(acc, reply.payload);
        state.partial |= reply.partial;
        state.outstanding.remove(&replier);
        self.stats.replies_folded += 1;

        let complete = !state.direct && state.outstanding.is_empty();
        if complete {
            self.flush(solicitation_id, now_ms)
        } else {
            Vec::new()
        }
    }

    /// Closes the reply slot for `solicitation_id` and emits the aggregate
    /// toward its route. The seen entry itself persists until TTL expiry.
    fn flush(&mut self, solicitation_id: MessageId, now_ms: u64) -> Vec<GossipAction> {
        let Some(state) = self
            .seen
            .get_mut(&solicitation_id)
            .and_then(|entry| entry.reply.take())
        else {
            return Vec::new();
        };

        let partial = state.partial || (!state.direct && !state.outstanding.is_empty());
        match state.route {
            ReplyRoute::Caller => vec![GossipAction::CallerReply {
                solicitation: solicitation_id,
                aggregate: state.aggregate,
                // A direct-mode collection has no known population; its
                // deadline close is the answer, not a shortfall.
                partial: if state.direct { false } else { partial },
            }],
            ReplyRoute::Upstream(parent) => vec![GossipAction::SendReply {
                to: ReplyAddress::Neighbor(parent),
                message: Message::reply_to(
                    solicitation_id,
                    state.verb.as_str(),
                    self.uid,
                    self.config.ttl_seconds,
                    state.aggregate,
                    partial,
                    now_ms / 1000,
                ),
            }],
        }
    }

    // -- Deadlines & garbage collection -------------------------------------

    /// The earliest pending reply deadline, if any.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        self.seen
            .values()
            .filter_map(|entry| entry.reply.as_ref().map(|s| s.deadline_at_ms))
            .min()
    }

    /// Flushes every reply slot whose deadline has passed.
    pub fn expire_due(&mut self, now_ms: u64) -> Vec<GossipAction> {
        let due: Vec<MessageId> = self
            .seen
            .iter()
            .filter(|(_, entry)| {
                entry
                    .reply
                    .as_ref()
                    .is_some_and(|s| s.deadline_at_ms <= now_ms)
            })
            .map(|(id, _)| *id)
            .collect();

        let mut actions = Vec::new();
        for id in due {
            debug!(node = %self.uid, solicitation = %id, "reply deadline fired, flushing aggregate");
            actions.extend(self.flush(id, now_ms));
        }
        actions
    }

    /// Removes every cache entry past its hard expiry. Open reply slots on
    /// an expired entry are abandoned; their deadline always lands inside
    /// the entry's lifetime, so in practice they have already flushed.
    pub fn evict_expired(&mut self, now_ms: u64) {
        let now_secs = now_ms / 1000;
        let before = self.seen.len();
        self.seen.retain(|_, entry| now_secs <= entry.hard_expiry_secs);
        let evicted = (before - self.seen.len()) as u64;
        if evicted > 0 {
            debug!(node = %self.uid, evicted, "seen-cache sweep");
            self.stats.evicted += evicted;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
