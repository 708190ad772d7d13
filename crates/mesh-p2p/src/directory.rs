//! Node directory: handshakes and the neighbor table.
//!
//! Every connection starts with each side sending a handshake frame carrying
//! its node id. The directory maps node ids learned this way to the connection
//! they arrived on, and translates connection-level events into node-level
//! ones.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::connection::{ConnectionEvent, FrameSink};
use crate::error::{P2pError, P2pResult};
use crate::protocol::{ConnectionId, Envelope, Frame, Handshake, NodeId};

/// Node-level events produced by the directory.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    /// A handshake completed and the node became a neighbor.
    NodeConnected {
        /// The new neighbor.
        node_id: NodeId,
    },
    /// A neighbor's connection went away.
    NodeDisconnected {
        /// The departed neighbor.
        node_id: NodeId,
    },
    /// A neighbor sent a gossip envelope.
    NodeMessage {
        /// The neighbor the envelope came from (not necessarily its origin).
        node_id: NodeId,
        /// The envelope.
        envelope: Envelope,
    },
}

/// The neighbor table plus handshake handling.
#[derive(Debug)]
pub struct NodeDirectory {
    local_id: NodeId,
    neighbors: HashMap<NodeId, ConnectionId>,
}

impl NodeDirectory {
    /// Creates an empty directory for the given local node id.
    #[must_use]
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            neighbors: HashMap::new(),
        }
    }

    /// Returns the local node id.
    #[must_use]
    pub const fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Returns the number of neighbors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    /// Returns true if there are no neighbors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    /// Iterates over current neighbor ids.
    pub fn neighbors(&self) -> impl Iterator<Item = &NodeId> {
        self.neighbors.keys()
    }

    /// Returns true if `node_id` is a neighbor.
    #[must_use]
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.neighbors.contains_key(node_id)
    }

    /// Returns the connection backing a neighbor.
    #[must_use]
    pub fn connection_for(&self, node_id: &NodeId) -> Option<ConnectionId> {
        self.neighbors.get(node_id).copied()
    }

    /// Reverse lookup: the neighbor bound to a connection.
    #[must_use]
    pub fn node_for(&self, connection_id: ConnectionId) -> Option<&NodeId> {
        self.neighbors
            .iter()
            .find(|(_, conn)| **conn == connection_id)
            .map(|(node, _)| node)
    }

    /// Handles a connection-level event.
    ///
    /// New connections get our handshake; handshakes, messages and
    /// disconnects are translated into node-level events.
    pub fn handle_event<S: FrameSink>(
        &mut self,
        sink: &mut S,
        event: ConnectionEvent,
    ) -> Option<DirectoryEvent> {
        match event {
            ConnectionEvent::Connected(connection_id) => {
                if let Err(e) = self.send_handshake(sink, connection_id) {
                    warn!(connection_id = %connection_id, error = %e, "Failed to send handshake");
                }
                None
            }
            ConnectionEvent::Message {
                connection_id,
                frame: Frame::Handshake(handshake),
            } => self.on_handshake(connection_id, handshake),
            ConnectionEvent::Message {
                connection_id,
                frame: Frame::Message(envelope),
            } => self.on_message(connection_id, envelope),
            ConnectionEvent::Disconnected(connection_id) => self.on_disconnect(connection_id),
        }
    }

    /// Sends our handshake on a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or its queue is full.
    pub fn send_handshake<S: FrameSink>(
        &self,
        sink: &mut S,
        connection_id: ConnectionId,
    ) -> P2pResult<()> {
        debug!(connection_id = %connection_id, "Sending handshake");
        sink.send_frame(connection_id, &Frame::handshake(self.local_id.clone()))
    }

    /// Sends an envelope to one neighbor.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::UnknownNode`] if `node_id` is not a neighbor, or the
    /// connection-level error if the write cannot be queued.
    pub fn send<S: FrameSink>(
        &self,
        sink: &mut S,
        node_id: &NodeId,
        envelope: Envelope,
    ) -> P2pResult<()> {
        let connection_id = self
            .connection_for(node_id)
            .ok_or_else(|| P2pError::UnknownNode(node_id.clone()))?;
        sink.send_frame(connection_id, &Frame::Message(envelope))
    }

    fn on_handshake(
        &mut self,
        connection_id: ConnectionId,
        handshake: Handshake,
    ) -> Option<DirectoryEvent> {
        let node_id = handshake.node_id;

        if node_id == self.local_id {
            warn!(connection_id = %connection_id, "Ignoring handshake carrying our own node id");
            return None;
        }

        if self.neighbors.get(&node_id) == Some(&connection_id) {
            debug!(node_id = %node_id, "Duplicate handshake ignored");
            return None;
        }

        // One node per connection: a connection that re-handshakes under a
        // new id loses its old binding.
        self.neighbors.retain(|_, conn| *conn != connection_id);

        if let Some(previous) = self.neighbors.insert(node_id.clone(), connection_id) {
            info!(node_id = %node_id, old = %previous, new = %connection_id, "Neighbor moved to new connection");
        } else {
            info!(node_id = %node_id, connection_id = %connection_id, "Neighbor connected");
        }

        Some(DirectoryEvent::NodeConnected { node_id })
    }

    fn on_message(
        &self,
        connection_id: ConnectionId,
        envelope: Envelope,
    ) -> Option<DirectoryEvent> {
        let Some(node_id) = self.node_for(connection_id) else {
            debug!(connection_id = %connection_id, "Message before handshake suppressed");
            return None;
        };
        Some(DirectoryEvent::NodeMessage {
            node_id: node_id.clone(),
            envelope,
        })
    }

    fn on_disconnect(&mut self, connection_id: ConnectionId) -> Option<DirectoryEvent> {
        let Some(node_id) = self.node_for(connection_id).cloned() else {
            debug!(connection_id = %connection_id, "Connection closed before handshake");
            return None;
        };
        self.neighbors.remove(&node_id);
        info!(node_id = %node_id, connection_id = %connection_id, "Neighbor disconnected");
        Some(DirectoryEvent::NodeDisconnected { node_id })
    }
}

/// A [`FrameSink`] that records frames instead of writing them.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub sent: Vec<(ConnectionId, Frame)>,
    pub closed: std::collections::HashSet<ConnectionId>,
}

#[cfg(test)]
impl FrameSink for RecordingSink {
    fn send_frame(&mut self, connection_id: ConnectionId, frame: &Frame) -> P2pResult<()> {
        if self.closed.contains(&connection_id) {
            return Err(P2pError::UnknownConnection(connection_id));
        }
        self.sent.push((connection_id, frame.clone()));
        Ok(())
    }
}
