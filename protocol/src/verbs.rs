//! # Verb Dispatch
//!
//! A verb is what a message *does* when it lands on a node. The registry
//! maps verb names to handlers; handlers are pure over the node view and
//! the message, which keeps them trivially testable and lets embedders
//! install their own verbs next to the built-ins.
//!
//! Solicitation verbs answer in two parts: `apply` produces this node's
//! own contribution, and `fold` merges downstream replies into the running
//! aggregate. Command verbs perform their side effect in `apply` and
//! return nothing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::message::{Message, Payload, VERB_COUNT_ALIVE, VERB_LIST_ALIVE};
use crate::registry::NodeUid;

/// The slice of node state a verb handler is allowed to see.
#[derive(Debug, Clone, Copy)]
pub struct NodeView {
    pub uid: NodeUid,
    pub neighbor_count: usize,
}

/// A registered verb.
pub trait VerbHandler: Send + Sync {
    /// Executes the verb on this node. Solicitation verbs return the local
    /// contribution to the aggregate; command verbs return `None`.
    fn apply(&self, node: &NodeView, message: &Message) -> Option<Payload>;

    /// Folds a downstream contribution into the running aggregate.
    /// The default keeps the latest contribution, which suits verbs whose
    /// replies do not compose.
    fn fold(&self, _acc: Payload, incoming: Payload) -> Payload {
        incoming
    }
}

// ---------------------------------------------------------------------------
// Built-in verbs
// ---------------------------------------------------------------------------

/// `count-alive`: every node contributes 1; folding sums.
struct CountAlive;

impl VerbHandler for CountAlive {
    fn apply(&self, _node: &NodeView, _message: &Message) -> Option<Payload> {
        Some(Payload::Count(1))
    }

    fn fold(&self, acc: Payload, incoming: Payload) -> Payload {
        match (acc, incoming) {
            (Payload::Count(a), Payload::Count(b)) => Payload::Count(a + b),
            (Payload::Count(a), _) => Payload::Count(a),
            (_, Payload::Count(b)) => Payload::Count(b),
            _ => Payload::Count(0),
        }
    }
}

/// `list-alive`: every node contributes its own UID; folding unions.
struct ListAlive;

impl VerbHandler for ListAlive {
    fn apply(&self, node: &NodeView, _message: &Message) -> Option<Payload> {
        Some(Payload::UidList(vec![node.uid]))
    }

    fn fold(&self, acc: Payload, incoming: Payload) -> Payload {
        let mut merged = match acc {
            Payload::UidList(uids) => uids,
            _ => Vec::new(),
        };
        if let Payload::UidList(uids) = incoming {
            merged.extend(uids);
        }
        merged.sort_unstable();
        merged.dedup();
        Payload::UidList(merged)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registration table: verb name → handler.
///
/// Shared by every node in the process; registration after startup is
/// allowed and takes effect for messages admitted afterwards.
pub struct VerbRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn VerbHandler>>>,
}

impl VerbRegistry {
    /// An empty table. Most callers want [`VerbRegistry::with_builtins`].
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// A table with `count-alive` and `list-alive` pre-registered.
    pub fn with_builtins() -> Arc<Self> {
        let registry = Self::new();
        registry.register(VERB_COUNT_ALIVE, Arc::new(CountAlive));
        registry.register(VERB_LIST_ALIVE, Arc::new(ListAlive));
        Arc::new(registry)
    }

    /// Installs a handler, replacing any previous registration.
    pub fn register(&self, verb: impl Into<String>, handler: Arc<dyn VerbHandler>) {
        let verb = verb.into();
        debug!(%verb, "registering verb handler");
        self.handlers.write().insert(verb, handler);
    }

    /// Looks up the handler for a verb name.
    pub fn get(&self, verb: &str) -> Option<Arc<dyn VerbHandler>> {
        self.handlers.read().get(verb).cloned()
    }

    pub fn contains(&self, verb: &str) -> bool {
        self.handlers.read().contains_key(verb)
    }
}

impl Default for VerbRegistry {
    fn default() -> Self {
        Self::new()
    }
}
