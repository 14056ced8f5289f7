//! # Gossip Messages
//!
//! The immutable record that travels the graph. A message is stamped once —
//! identity, origin, timestamp, and TTL are set when it first enters the
//! graph and never touched again. Everything downstream (admission bands,
//! loop suppression, reply correlation) keys off those frozen fields.
//!
//! ## Expiry bands
//!
//! A message with `timestamp` and `ttl_seconds` expires at
//! `timestamp + ttl_seconds`, but the cache entry it leaves behind lives a
//! full TTL longer. That second band is what makes the seen cache safe to
//! garbage-collect: a straggler arriving inside the grace band is dropped
//! without disturbing the cache, and one arriving after it evicts the
//! entry on its way out.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::NodeUid;

/// Verb answered with the number of reachable nodes.
pub const VERB_COUNT_ALIVE: &str = "count-alive";

/// Verb answered with the UIDs of reachable nodes.
pub const VERB_LIST_ALIVE: &str = "list-alive";

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Globally unique message identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Mints a fresh identifier.
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Kind & Payload
// ---------------------------------------------------------------------------

/// The three interaction patterns a message can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Fire-and-forget: execute the verb's side effect, no reply.
    Command,
    /// Query: execute the verb and send an aggregated reply upstream.
    Solicit,
    /// Answer to a solicitation, routed point-to-point, never flooded.
    Reply,
}

/// Verb-specific message payload.
///
/// The built-in verbs use the typed variants; embedder verbs that need
/// their own encoding ride in `Opaque`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// No payload.
    None,
    /// A count, summed during aggregation.
    Count(u64),
    /// A UID set, unioned during aggregation.
    UidList(Vec<NodeUid>),
    /// Verb-specific bytes the core does not interpret.
    Opaque(Vec<u8>),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::None
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Where a fresh-band check landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryBand {
    /// Within TTL: admissible.
    Fresh,
    /// Past expiry but within one extra TTL: drop, leave the cache alone.
    SoftExpired,
    /// More than a full TTL past expiry: drop and evict any cache entry.
    HardExpired,
}

/// The immutable gossip record.
///
/// `timestamp` and `ttl_seconds` are set at first admission to the graph
/// and never modified; forwarding re-sends the record verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique identity; the seen-cache key.
    pub id: MessageId,
    /// Interaction pattern.
    pub kind: MessageKind,
    /// Verb name dispatched through the verb registry.
    pub verb: String,
    /// UID of the local node that introduced the message to the graph.
    pub origin_uid: NodeUid,
    /// For replies: the solicitation being answered.
    pub solicitation_id: Option<MessageId>,
    /// Seconds since Unix epoch at first admission.
    pub timestamp: u64,
    /// Positive TTL; absolute expiry is `timestamp + ttl_seconds`.
    pub ttl_seconds: u64,
    /// Solicit only: route replies straight to the origin instead of
    /// aggregating up the propagation tree.
    pub direct_reply: bool,
    /// Reply only: the aggregate was flushed with replies outstanding.
    pub partial: bool,
    /// Verb-specific payload.
    pub payload: Payload,
}

impl Message {
    /// Builds a fire-and-forget command, stamped now.
    pub fn command(
        verb: impl Into<String>,
        origin_uid: NodeUid,
        ttl_seconds: u64,
        payload: Payload,
        now_secs: u64,
    ) -> Self {
        Self {
            id: MessageId::fresh(),
            kind: MessageKind::Command,
            verb: verb.into(),
            origin_uid,
            solicitation_id: None,
            timestamp: now_secs,
            ttl_seconds,
            direct_reply: false,
            partial: false,
            payload,
        }
    }

    /// Builds a solicitation, stamped now.
    pub fn solicit(
        verb: impl Into<String>,
        origin_uid: NodeUid,
        ttl_seconds: u64,
        payload: Payload,
        direct_reply: bool,
        now_secs: u64,
    ) -> Self {
        Self {
            id: MessageId::fresh(),
            kind: MessageKind::Solicit,
            verb: verb.into(),
            origin_uid,
            solicitation_id: None,
            timestamp: now_secs,
            ttl_seconds,
            direct_reply,
            partial: false,
            payload,
        }
    }

    /// Builds a reply answering `solicitation`, carrying `payload` from
    /// `replier`. The reply inherits the solicitation's verb and TTL.
    pub fn reply_to(
        solicitation_id: MessageId,
        verb: impl Into<String>,
        replier: NodeUid,
        ttl_seconds: u64,
        payload: Payload,
        partial: bool,
        now_secs: u64,
    ) -> Self {
        Self {
            id: MessageId::fresh(),
            kind: MessageKind::Reply,
            verb: verb.into(),
            origin_uid: replier,
            solicitation_id: Some(solicitation_id),
            timestamp: now_secs,
            ttl_seconds,
            direct_reply: false,
            partial,
            payload,
        }
    }

    /// Absolute expiry in Unix seconds.
    pub fn expiry(&self) -> u64 {
        self.timestamp + self.ttl_seconds
    }

    /// Unix second after which any cache entry for this id must be gone.
    pub fn hard_expiry(&self) -> u64 {
        self.timestamp + 2 * self.ttl_seconds
    }

    /// Classifies this message against the clock.
    pub fn expiry_band(&self, now_secs: u64) -> ExpiryBand {
        if now_secs > self.hard_expiry() {
            ExpiryBand::HardExpired
        } else if now_secs > self.expiry() {
            ExpiryBand::SoftExpired
        } else {
            ExpiryBand::Fresh
        }
    }
}

// ---------------------------------------------------------------------------
// Wire envelope
// ---------------------------------------------------------------------------

/// The object that crosses the wire: a destination and a message. A
/// destination of [`NodeUid::ANONYMOUS`] is delivered to every local node
/// on the receiving process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub destination: NodeUid,
    pub message: Message,
}

// ---------------------------------------------------------------------------
// Clock helpers
// ---------------------------------------------------------------------------

/// Current Unix time in whole seconds.
pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current Unix time in milliseconds.
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
