//! Wire protocol definitions for mesh communication.
//!
//! Every frame is a single JSON object on its own line:
//!
//! ```text
//! {"type":"handshake","data":{"nodeId":"..."}}
//! {"type":"message","data":{"id":"...","ttl":3,"type":"broadcast","message":...,"origin":"..."}}
//! ```
//!
//! This module defines the identifiers used at each layer:
//! - [`ConnectionId`]: names one live socket, generated locally
//! - [`NodeId`]: names a logical peer, supplied by that peer at handshake
//! - [`MessageId`]: names one logical gossip message across every hop

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::P2pResult;

/// Identifier of a single transport-level connection.
///
/// Connection ids are ephemeral and never leave the local process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Creates a new random `ConnectionId`.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical identifier of a mesh participant.
///
/// Opaque to this crate: remote peers may announce any string. Locally
/// generated ids are UUID v4 strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Generates a fresh random node id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a logical gossip message, shared by every relayed copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Creates a new random message id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of gossip envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// Delivered to every node the flood reaches.
    #[serde(rename = "broadcast")]
    Broadcast,
    /// Delivered only to the node named by the destination.
    #[serde(rename = "dm")]
    Direct,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast => f.write_str("broadcast"),
            Self::Direct => f.write_str("dm"),
        }
    }
}

/// The unit of gossip relayed hop by hop.
///
/// Only `ttl` changes between hops; see [`Envelope::forwarded`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message id, unique per logical message.
    pub id: MessageId,
    /// Remaining hops.
    pub ttl: u32,
    /// Broadcast or direct.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Opaque application payload.
    #[serde(default)]
    pub message: serde_json::Value,
    /// Node that created the message.
    pub origin: NodeId,
    /// Addressee, present only for direct messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<NodeId>,
}

impl Envelope {
    /// Creates a broadcast envelope with a fresh id.
    #[must_use]
    pub fn broadcast(origin: NodeId, message: serde_json::Value, ttl: u32) -> Self {
        Self {
            id: MessageId::new(),
            ttl,
            kind: EnvelopeKind::Broadcast,
            message,
            origin,
            destination: None,
        }
    }

    /// Creates a direct envelope with a fresh id.
    #[must_use]
    pub fn direct(
        origin: NodeId,
        destination: NodeId,
        message: serde_json::Value,
        ttl: u32,
    ) -> Self {
        Self {
            id: MessageId::new(),
            ttl,
            kind: EnvelopeKind::Direct,
            message,
            origin,
            destination: Some(destination),
        }
    }

    /// Replaces the message id.
    #[must_use]
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    /// Replaces the ttl.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    /// Returns true if the envelope may not travel any further.
    #[must_use]
    pub const fn is_expired(&self) -> bool {
        self.ttl < 1
    }

    /// Returns the copy to relay to the next hop, or `None` if the
    /// decremented ttl would be exhausted.
    #[must_use]
    pub fn forwarded(&self) -> Option<Self> {
        let ttl = self.ttl.checked_sub(1).filter(|t| *t >= 1)?;
        Some(Self {
            ttl,
            ..self.clone()
        })
    }
}

/// Body of a handshake frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// The sender's node id.
    #[serde(rename = "nodeId")]
    pub node_id: NodeId,
}

/// A single line on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Frame {
    /// Announces the sender's node id; sent first on every connection.
    Handshake(Handshake),
    /// Carries a gossip envelope.
    Message(Envelope),
}

impl Frame {
    /// Creates a handshake frame.
    #[must_use]
    pub const fn handshake(node_id: NodeId) -> Self {
        Self::Handshake(Handshake { node_id })
    }

    /// Serializes to a single JSON line (without the trailing newline).
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_line(&self) -> P2pResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a frame from one line.
    ///
    /// # Errors
    ///
    /// Returns an error if the line is not a valid frame.
    pub fn from_line(line: &str) -> P2pResult<Self> {
        Self::from_slice(line.as_bytes())
    }

    /// Parses a frame from the raw bytes of one line.
    ///
    /// Bytes that are not valid UTF-8 fail like any other malformed line.
    ///
    /// # Errors
    ///
    /// Returns an error if the line is not a valid frame.
    pub fn from_slice(line: &[u8]) -> P2pResult<Self> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        Ok(serde_json::from_slice(line)?)
    }
}
