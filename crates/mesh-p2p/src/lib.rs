//! # mesh-p2p
//!
//! Flood-gossip overlay networking over plain TCP.
//!
//! The crate is built in three layers, each on top of the one below:
//!
//! - **Connections** ([`connection`]): raw sockets, one JSON frame per line,
//!   listen/connect/send/close
//! - **Directory** ([`directory`]): handshake exchange of node ids and the
//!   neighbor table
//! - **Router** ([`router`]): broadcast and direct-message flooding with ttl
//!   decay and a bounded seen-message cache
//!
//! A single event loop ([`mesh`]) owns all three; applications talk to it
//! through a cloneable [`MeshHandle`] and receive [`MeshEvent`]s by
//! subscribing.
//!
//! ## Core Types
//!
//! - [`NodeId`]: logical identity of a participant, announced at handshake
//! - [`Envelope`]: one gossip message, relayed hop by hop
//! - [`MeshConfig`]: tunables, loadable from TOML
//!
//! ```no_run
//! use mesh_p2p::{Mesh, MeshConfig, MeshEvent};
//!
//! # async fn example() -> mesh_p2p::P2pResult<()> {
//! let mesh = Mesh::spawn(MeshConfig::default())?;
//! let mut events = mesh.subscribe();
//! mesh.listen(7000).await?;
//! mesh.connect("127.0.0.1", 7001).await?;
//! mesh.broadcast(serde_json::json!({"price": 42})).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let MeshEvent::Broadcast { message, origin } = event {
//!         println!("{origin}: {message}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod mesh;
pub mod protocol;
pub mod router;

pub use codec::{LineFrameCodec, RawLine};
pub use config::{DEFAULT_BROADCAST_TTL, DEFAULT_DIRECT_TTL, MeshConfig};
pub use connection::{
    ConnectionEvent, ConnectionInfo, ConnectionManager, ConnectionManagerConfig, Direction,
    FrameSink, TransportEvent,
};
pub use directory::{DirectoryEvent, NodeDirectory};
pub use error::{P2pError, P2pResult};
pub use mesh::{DisconnectHandle, ListenerHandle, Mesh, MeshEvent, MeshHandle, MeshStats};
pub use protocol::{ConnectionId, Envelope, EnvelopeKind, Frame, Handshake, MessageId, NodeId};
pub use router::{Delivery, GossipRouter, RouteDecision, RouterConfig, RouterStats, SeenCache};
