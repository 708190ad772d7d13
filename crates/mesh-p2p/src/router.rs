//! Flood-based gossip routing.
//!
//! Broadcasts and direct messages are both flooded to every neighbor. Each
//! node relays a message id at most once, enforced by a [`SeenCache`], and each
//! hop decrements the envelope ttl until it runs out.
//!
//! The router only decides; sending goes through the [`NodeDirectory`] and a
//! [`FrameSink`], so the whole relay path can be exercised without sockets.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use crate::config::MeshConfig;
use crate::connection::FrameSink;
use crate::directory::NodeDirectory;
use crate::protocol::{Envelope, EnvelopeKind, MessageId, NodeId};

/// Bounded set of message ids already handled.
///
/// Entries leave the cache when they are older than the configured lifetime
/// or, once full, oldest first.
#[derive(Debug)]
pub struct SeenCache {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<MessageId, Instant>,
    /// Insertion order; oldest at the front.
    order: VecDeque<MessageId>,
}

impl SeenCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns the number of remembered ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true if `id` has been seen and not yet expired.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.contains_at(id, Instant::now())
    }

    /// Records `id`. Returns false if it was already present.
    pub fn insert(&mut self, id: MessageId) -> bool {
        self.insert_at(id, Instant::now())
    }

    fn contains_at(&self, id: &MessageId, now: Instant) -> bool {
        self.entries
            .get(id)
            .is_some_and(|added| now.saturating_duration_since(*added) < self.ttl)
    }

    fn insert_at(&mut self, id: MessageId, now: Instant) -> bool {
        self.expire(now);
        if self.entries.contains_key(&id) {
            return false;
        }

        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }

        self.entries.insert(id.clone(), now);
        self.order.push_back(id);
        true
    }

    /// Drops expired entries from the front of the order queue.
    fn expire(&mut self, now: Instant) {
        while let Some(front) = self.order.front() {
            let expired = self
                .entries
                .get(front)
                .is_none_or(|added| now.saturating_duration_since(*added) >= self.ttl);
            if !expired {
                break;
            }
            if let Some(id) = self.order.pop_front() {
                self.entries.remove(&id);
            }
        }
    }
}

/// A message handed to the local application.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A broadcast reached this node.
    Broadcast {
        /// Payload.
        message: Value,
        /// Node that originated it.
        origin: NodeId,
    },
    /// A direct message addressed to this node arrived.
    Direct {
        /// Node that originated it.
        origin: NodeId,
        /// Payload.
        message: Value,
    },
}

/// What to do with an inbound envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteDecision {
    /// Message for the local application, if any.
    pub delivery: Option<Delivery>,
    /// Copy to flood to every neighbor, if any.
    pub forward: Option<Envelope>,
}

impl RouteDecision {
    /// Returns true if nothing is delivered or forwarded.
    #[must_use]
    pub const fn is_drop(&self) -> bool {
        self.delivery.is_none() && self.forward.is_none()
    }
}

/// Router configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Initial ttl for broadcasts.
    pub broadcast_ttl: u32,
    /// Initial ttl for direct messages.
    pub direct_ttl: u32,
    /// Seen-cache capacity.
    pub seen_cache_capacity: usize,
    /// Seen-cache entry lifetime.
    pub seen_cache_ttl: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::from(&MeshConfig::default())
    }
}

impl From<&MeshConfig> for RouterConfig {
    fn from(config: &MeshConfig) -> Self {
        Self {
            broadcast_ttl: config.broadcast_ttl,
            direct_ttl: config.direct_ttl,
            seen_cache_capacity: config.seen_cache_capacity,
            seen_cache_ttl: config.seen_cache_ttl(),
        }
    }
}

/// Counters describing router activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Envelopes originated locally.
    pub originated: u64,
    /// Envelopes delivered to the local application.
    pub delivered: u64,
    /// Individual neighbor sends performed while flooding.
    pub relayed: u64,
    /// Inbound envelopes dropped because their id was already seen.
    pub duplicates: u64,
    /// Envelopes dropped because their ttl ran out.
    pub expired: u64,
    /// Inbound envelopes dropped as malformed.
    pub malformed: u64,
}

/// Decides delivery and relay for every gossip envelope.
#[derive(Debug)]
pub struct GossipRouter {
    local_id: NodeId,
    config: RouterConfig,
    seen: SeenCache,
    stats: RouterStats,
}

impl GossipRouter {
    /// Creates a router for the given local node id.
    #[must_use]
    pub fn new(local_id: NodeId, config: RouterConfig) -> Self {
        let seen = SeenCache::new(config.seen_cache_capacity, config.seen_cache_ttl);
        Self {
            local_id,
            config,
            seen,
            stats: RouterStats::default(),
        }
    }

    /// Returns the local node id.
    #[must_use]
    pub const fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Returns the router configuration.
    #[must_use]
    pub const fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Returns activity counters.
    #[must_use]
    pub const fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Returns true if the message id has been handled.
    #[must_use]
    pub fn has_seen(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    /// Builds a broadcast envelope from this node with the default ttl.
    #[must_use]
    pub fn new_broadcast(&self, message: Value) -> Envelope {
        Envelope::broadcast(self.local_id.clone(), message, self.config.broadcast_ttl)
    }

    /// Builds a direct envelope from this node with the default ttl.
    #[must_use]
    pub fn new_direct(&self, destination: NodeId, message: Value) -> Envelope {
        Envelope::direct(
            self.local_id.clone(),
            destination,
            message,
            self.config.direct_ttl,
        )
    }

    /// Accepts a locally originated envelope.
    ///
    /// Returns the envelope to flood, or `None` if its id was already used or
    /// its ttl is already exhausted. Either way the id is marked seen so echoes
    /// from neighbors are ignored.
    pub fn originate(&mut self, envelope: Envelope) -> Option<Envelope> {
        if !self.seen.insert(envelope.id.clone()) {
            debug!(message_id = %envelope.id, "Originated id already seen");
            self.stats.duplicates += 1;
            return None;
        }
        if envelope.is_expired() {
            debug!(message_id = %envelope.id, "Originated envelope has no ttl");
            self.stats.expired += 1;
            return None;
        }
        self.stats.originated += 1;
        Some(envelope)
    }

    /// Handles an envelope received from neighbor `from`.
    pub fn handle_incoming(&mut self, from: &NodeId, envelope: Envelope) -> RouteDecision {
        if self.seen.contains(&envelope.id) {
            self.stats.duplicates += 1;
            return RouteDecision::default();
        }

        if envelope.is_expired() {
            self.seen.insert(envelope.id.clone());
            self.stats.expired += 1;
            debug!(message_id = %envelope.id, from = %from, "Dropping envelope with exhausted ttl");
            return RouteDecision::default();
        }

        if envelope.kind == EnvelopeKind::Direct && envelope.destination.is_none() {
            self.seen.insert(envelope.id.clone());
            self.stats.malformed += 1;
            debug!(message_id = %envelope.id, from = %from, "Dropping direct message without destination");
            return RouteDecision::default();
        }

        self.seen.insert(envelope.id.clone());

        let for_us = envelope.destination.as_ref() == Some(&self.local_id);
        let decision = match envelope.kind {
            EnvelopeKind::Broadcast => RouteDecision {
                forward: self.next_hop(&envelope),
                delivery: Some(Delivery::Broadcast {
                    message: envelope.message,
                    origin: envelope.origin,
                }),
            },
            EnvelopeKind::Direct if for_us => RouteDecision {
                forward: None,
                delivery: Some(Delivery::Direct {
                    origin: envelope.origin,
                    message: envelope.message,
                }),
            },
            EnvelopeKind::Direct => RouteDecision {
                forward: self.next_hop(&envelope),
                delivery: None,
            },
        };

        if decision.delivery.is_some() {
            self.stats.delivered += 1;
        }
        decision
    }

    /// Sends `envelope` to every current neighbor.
    ///
    /// A failed send to one neighbor is logged and does not stop the rest.
    /// Returns the number of neighbors the envelope was queued for.
    pub fn flood<S: FrameSink>(
        &mut self,
        directory: &NodeDirectory,
        sink: &mut S,
        envelope: &Envelope,
    ) -> usize {
        let mut sent = 0;
        for node_id in directory.neighbors() {
            match directory.send(sink, node_id, envelope.clone()) {
                Ok(()) => sent += 1,
                Err(e) => {
                    debug!(message_id = %envelope.id, node_id = %node_id, error = %e, "Relay send failed");
                }
            }
        }
        debug!(message_id = %envelope.id, kind = %envelope.kind, ttl = envelope.ttl, sent, "Flooded envelope");
        self.stats.relayed += sent as u64;
        sent
    }

    fn next_hop(&mut self, envelope: &Envelope) -> Option<Envelope> {
        let next = envelope.forwarded();
        if next.is_none() {
            self.stats.expired += 1;
        }
        next
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
