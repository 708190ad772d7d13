//! The mesh event loop and its public handle.
//!
//! A [`MeshNode`] task owns the [`ConnectionManager`], the [`NodeDirectory`]
//! and the [`GossipRouter`] and is the only code that touches them. Socket
//! tasks feed it transport events; [`MeshHandle`] clones feed it commands.
//! Application events fan out to every subscriber over a broadcast channel.
//!
//! Binding and dialing are awaited by the caller, never by the loop, so a slow
//! peer cannot stall gossip for everyone else.

use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::config::MeshConfig;
use crate::connection::{
    self, ConnectionEvent, ConnectionInfo, ConnectionManager, ConnectionManagerConfig, Direction,
    TransportEvent,
};
use crate::directory::{DirectoryEvent, NodeDirectory};
use crate::error::{P2pError, P2pResult};
use crate::protocol::{ConnectionId, Envelope, MessageId, NodeId};
use crate::router::{Delivery, GossipRouter, RouterConfig, RouterStats};

/// Events delivered to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// A neighbor completed its handshake.
    NodeConnected {
        /// The neighbor.
        node_id: NodeId,
    },
    /// A neighbor's connection closed.
    NodeDisconnected {
        /// The neighbor.
        node_id: NodeId,
    },
    /// A broadcast reached this node.
    Broadcast {
        /// Payload.
        message: Value,
        /// Originating node.
        origin: NodeId,
    },
    /// A direct message addressed to this node arrived.
    Direct {
        /// Originating node.
        origin: NodeId,
        /// Payload.
        message: Value,
    },
}

impl From<Delivery> for MeshEvent {
    fn from(delivery: Delivery) -> Self {
        match delivery {
            Delivery::Broadcast { message, origin } => Self::Broadcast { message, origin },
            Delivery::Direct { origin, message } => Self::Direct { origin, message },
        }
    }
}

/// Point-in-time view of a running mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshStats {
    /// Neighbors with a completed handshake.
    pub neighbors: usize,
    /// Open connections, including those still handshaking.
    pub connections: usize,
    /// Bound listener address, if listening.
    pub listen_addr: Option<SocketAddr>,
    /// Router counters.
    pub router: RouterStats,
}

#[derive(Debug)]
enum Command {
    StartListener {
        listener: TcpListener,
        reply: oneshot::Sender<P2pResult<SocketAddr>>,
    },
    StopListener {
        addr: SocketAddr,
        reply: oneshot::Sender<bool>,
    },
    Register {
        stream: TcpStream,
        remote_addr: SocketAddr,
        reply: oneshot::Sender<ConnectionId>,
    },
    Disconnect {
        connection_id: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    CloseAll {
        reply: oneshot::Sender<()>,
    },
    Originate {
        envelope: Envelope,
        reply: oneshot::Sender<usize>,
    },
    SendTo {
        node_id: NodeId,
        envelope: Envelope,
        reply: oneshot::Sender<P2pResult<()>>,
    },
    Neighbors {
        reply: oneshot::Sender<Vec<NodeId>>,
    },
    Connections {
        reply: oneshot::Sender<Vec<ConnectionInfo>>,
    },
    Stats {
        reply: oneshot::Sender<MeshStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Sends a command and waits for its reply.
async fn request<T>(
    commands: &mpsc::Sender<Command>,
    make: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> P2pResult<T> {
    let (reply, response) = oneshot::channel();
    commands
        .send(make(reply))
        .await
        .map_err(|_| P2pError::Shutdown)?;
    response.await.map_err(|_| P2pError::Shutdown)
}

/// Entry point for starting a mesh participant.
#[derive(Debug)]
pub struct Mesh;

impl Mesh {
    /// Validates `config` and spawns the event loop on the current tokio
    /// runtime.
    ///
    /// The loop runs until [`MeshHandle::shutdown`] is called or every
    /// `MeshHandle` clone is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Config`] if the configuration is invalid.
    pub fn spawn(config: MeshConfig) -> P2pResult<MeshHandle> {
        config.validate()?;

        let local_id = config.node_id.clone().unwrap_or_else(NodeId::generate);
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
        let (transport_tx, transport_rx) = mpsc::channel(config.event_buffer);
        let (events_tx, _) = broadcast::channel(config.event_buffer);

        let manager_config = ConnectionManagerConfig {
            max_frame_length: config.max_frame_length,
            outbound_buffer: config.outbound_buffer,
            connect_timeout: config.connect_timeout(),
        };

        let node = MeshNode {
            connections: ConnectionManager::new(manager_config, transport_tx),
            directory: NodeDirectory::new(local_id.clone()),
            router: GossipRouter::new(local_id.clone(), RouterConfig::from(&config)),
            events: events_tx.clone(),
            commands: command_rx,
            transport: transport_rx,
        };

        info!(node_id = %local_id, "Starting mesh node");
        tokio::spawn(node.run());

        Ok(MeshHandle {
            local_id,
            config: Arc::new(config),
            commands: command_tx,
            events: events_tx,
        })
    }
}

/// The event loop. Sole owner of every table.
struct MeshNode {
    connections: ConnectionManager,
    directory: NodeDirectory,
    router: GossipRouter,
    events: broadcast::Sender<MeshEvent>,
    commands: mpsc::Receiver<Command>,
    transport: mpsc::Receiver<TransportEvent>,
}

impl MeshNode {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).is_break() {
                            break;
                        }
                    }
                    None => {
                        debug!("All mesh handles dropped");
                        self.close_all();
                        break;
                    }
                },
                Some(event) = self.transport.recv() => {
                    if let Some(event) = self.connections.handle_transport_event(event) {
                        self.on_connection_event(event);
                    }
                }
            }
        }
        info!(node_id = %self.directory.local_id(), "Mesh node stopped");
    }

    /// Applies one command. Breaks when the loop must stop.
    fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::StartListener { listener, reply } => {
                let _ = reply.send(self.connections.start_listener(listener));
            }
            Command::StopListener { addr, reply } => {
                let _ = reply.send(self.connections.stop_listener_at(addr));
            }
            Command::Register {
                stream,
                remote_addr,
                reply,
            } => {
                let event = self
                    .connections
                    .register(stream, remote_addr, Direction::Outbound);
                if let ConnectionEvent::Connected(connection_id) = event {
                    let _ = reply.send(connection_id);
                }
                self.on_connection_event(event);
            }
            Command::Disconnect {
                connection_id,
                reply,
            } => {
                let closed = match self.connections.close(connection_id) {
                    Some(event) => {
                        self.on_connection_event(event);
                        true
                    }
                    None => false,
                };
                let _ = reply.send(closed);
            }
            Command::CloseAll { reply } => {
                self.close_all();
                let _ = reply.send(());
            }
            Command::Originate { envelope, reply } => {
                let sent = match self.router.originate(envelope) {
                    Some(envelope) => {
                        self.router
                            .flood(&self.directory, &mut self.connections, &envelope)
                    }
                    None => 0,
                };
                let _ = reply.send(sent);
            }
            Command::SendTo {
                node_id,
                envelope,
                reply,
            } => {
                let result = self
                    .directory
                    .send(&mut self.connections, &node_id, envelope);
                let _ = reply.send(result);
            }
            Command::Neighbors { reply } => {
                let mut neighbors: Vec<NodeId> = self.directory.neighbors().cloned().collect();
                neighbors.sort();
                let _ = reply.send(neighbors);
            }
            Command::Connections { reply } => {
                let _ = reply.send(self.connections.connections());
            }
            Command::Stats { reply } => {
                let _ = reply.send(MeshStats {
                    neighbors: self.directory.len(),
                    connections: self.connections.len(),
                    listen_addr: self.connections.listen_addr(),
                    router: self.router.stats(),
                });
            }
            Command::Shutdown { reply } => {
                self.close_all();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        let Some(event) = self.directory.handle_event(&mut self.connections, event) else {
            return;
        };

        match event {
            DirectoryEvent::NodeConnected { node_id } => {
                self.emit(MeshEvent::NodeConnected { node_id });
            }
            DirectoryEvent::NodeDisconnected { node_id } => {
                self.emit(MeshEvent::NodeDisconnected { node_id });
            }
            DirectoryEvent::NodeMessage { node_id, envelope } => {
                let decision = self.router.handle_incoming(&node_id, envelope);
                if let Some(forward) = decision.forward {
                    self.router
                        .flood(&self.directory, &mut self.connections, &forward);
                }
                if let Some(delivery) = decision.delivery {
                    self.emit(delivery.into());
                }
            }
        }
    }

    fn close_all(&mut self) {
        for event in self.connections.close_all() {
            self.on_connection_event(event);
        }
    }

    fn emit(&self, event: MeshEvent) {
        if self.events.send(event).is_err() {
            trace!("No subscribers for mesh event");
        }
    }
}

/// Cloneable handle to a running mesh.
#[derive(Debug, Clone)]
pub struct MeshHandle {
    local_id: NodeId,
    config: Arc<MeshConfig>,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<MeshEvent>,
}

impl MeshHandle {
    /// Returns the local node id.
    #[must_use]
    pub const fn id(&self) -> &NodeId {
        &self.local_id
    }

    /// Returns the configuration the mesh was started with.
    #[must_use]
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Subscribes to application events. Drop the receiver to unsubscribe.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Binds `0.0.0.0:port` and starts accepting connections.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::AlreadyListening`] if a listener is active, or an
    /// I/O error if binding fails.
    pub async fn listen(&self, port: u16) -> P2pResult<ListenerHandle> {
        if let Some(addr) = self.stats().await?.listen_addr {
            return Err(P2pError::AlreadyListening(addr));
        }
        let listener = connection::bind_listener(port).await?;
        let local_addr = request(&self.commands, |reply| Command::StartListener {
            listener,
            reply,
        })
        .await??;

        Ok(ListenerHandle {
            local_addr,
            commands: self.commands.downgrade(),
        })
    }

    /// Connects to `host:port` and registers the connection.
    ///
    /// Resolves once the socket is registered; the handshake completes
    /// asynchronously and is reported as [`MeshEvent::NodeConnected`].
    ///
    /// # Errors
    ///
    /// Returns an I/O or timeout error if the connect fails.
    pub async fn connect(&self, host: &str, port: u16) -> P2pResult<DisconnectHandle> {
        let stream = connection::dial(host, port, self.config.connect_timeout()).await?;
        let remote_addr = stream.peer_addr()?;
        let connection_id = request(&self.commands, |reply| Command::Register {
            stream,
            remote_addr,
            reply,
        })
        .await?;

        Ok(DisconnectHandle {
            connection_id,
            remote_addr,
            commands: self.commands.downgrade(),
        })
    }

    /// Closes every connection and stops the listener. The loop keeps running.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Shutdown`] if the loop has stopped.
    pub async fn close(&self) -> P2pResult<()> {
        request(&self.commands, |reply| Command::CloseAll { reply }).await
    }

    /// Stops the event loop, closing every connection first.
    ///
    /// Calling it on a mesh that already stopped is a no-op.
    pub async fn shutdown(&self) {
        if request(&self.commands, |reply| Command::Shutdown { reply })
            .await
            .is_err()
        {
            debug!("Mesh already stopped");
        }
    }

    /// Broadcasts `message` to the whole mesh with the configured ttl.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Shutdown`] if the loop has stopped.
    pub async fn broadcast(&self, message: Value) -> P2pResult<MessageId> {
        let envelope = Envelope::broadcast(self.local_id.clone(), message, self.config.broadcast_ttl);
        let id = envelope.id.clone();
        self.originate(envelope).await?;
        Ok(id)
    }

    /// Sends `message` to `destination` by flooding with the configured ttl.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Shutdown`] if the loop has stopped.
    pub async fn direct(&self, destination: NodeId, message: Value) -> P2pResult<MessageId> {
        let envelope = Envelope::direct(
            self.local_id.clone(),
            destination,
            message,
            self.config.direct_ttl,
        );
        let id = envelope.id.clone();
        self.originate(envelope).await?;
        Ok(id)
    }

    /// Originates an envelope with caller-chosen id, origin and ttl.
    ///
    /// Returns the number of neighbors it was queued for. An envelope whose
    /// id was already seen, or whose ttl is below 1, is not sent.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Shutdown`] if the loop has stopped.
    pub async fn originate(&self, envelope: Envelope) -> P2pResult<usize> {
        request(&self.commands, |reply| Command::Originate { envelope, reply }).await
    }

    /// Sends an envelope to one neighbor without touching the seen cache.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::UnknownNode`] if `node_id` is not a neighbor,
    /// [`P2pError::Backpressure`] if its queue is full, or
    /// [`P2pError::Shutdown`] if the loop has stopped.
    pub async fn send_to(&self, node_id: NodeId, envelope: Envelope) -> P2pResult<()> {
        request(&self.commands, |reply| Command::SendTo {
            node_id,
            envelope,
            reply,
        })
        .await?
    }

    /// Returns a snapshot of current neighbor ids, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Shutdown`] if the loop has stopped.
    pub async fn neighbors(&self) -> P2pResult<Vec<NodeId>> {
        request(&self.commands, |reply| Command::Neighbors { reply }).await
    }

    /// Returns info for every open connection.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Shutdown`] if the loop has stopped.
    pub async fn connections(&self) -> P2pResult<Vec<ConnectionInfo>> {
        request(&self.commands, |reply| Command::Connections { reply }).await
    }

    /// Returns current statistics.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::Shutdown`] if the loop has stopped.
    pub async fn stats(&self) -> P2pResult<MeshStats> {
        request(&self.commands, |reply| Command::Stats { reply }).await
    }
}

/// Handle to an active listener.
///
/// Does not keep the mesh alive.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    commands: mpsc::WeakSender<Command>,
}

impl ListenerHandle {
    /// Returns the bound address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops this listener. Returns false if it was already stopped, was
    /// replaced by a newer listener, or the mesh is gone.
    pub async fn stop(&self) -> bool {
        let Some(commands) = self.commands.upgrade() else {
            return false;
        };
        let addr = self.local_addr;
        request(&commands, |reply| Command::StopListener { addr, reply })
            .await
            .unwrap_or(false)
    }
}

/// Handle to one outbound connection.
///
/// Does not keep the mesh alive.
#[derive(Debug, Clone)]
pub struct DisconnectHandle {
    connection_id: ConnectionId,
    remote_addr: SocketAddr,
    commands: mpsc::WeakSender<Command>,
}

impl DisconnectHandle {
    /// Returns the connection id.
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Returns the remote address.
    #[must_use]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Closes the connection. Returns false if it was already closed or the
    /// mesh is gone.
    pub async fn disconnect(&self) -> bool {
        let Some(commands) = self.commands.upgrade() else {
            return false;
        };
        let connection_id = self.connection_id;
        request(&commands, |reply| Command::Disconnect {
            connection_id,
            reply,
        })
        .await
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spawn_named(name: &str) -> MeshHandle {
        Mesh::spawn(MeshConfig::default().with_node_id(name)).unwrap()
    }

    #[test]
    fn delivery_maps_to_event() {
        let event: MeshEvent = Delivery::Direct {
            origin: NodeId::from("a"),
            message: json!(1),
        }
        .into();
        assert_eq!(
            event,
            MeshEvent::Direct {
                origin: NodeId::from("a"),
                message: json!(1),
            }
        );
    }

    #[tokio::test]
    async fn spawn_rejects_invalid_config() {
        let err = Mesh::spawn(MeshConfig::default().with_broadcast_ttl(0)).unwrap_err();
        assert!(matches!(err, P2pError::Config(_)));
    }

    #[tokio::test]
    async fn configured_node_id_is_used() {
        let mesh = spawn_named("oracle-a");
        assert_eq!(mesh.id(), &NodeId::from("oracle-a"));
    }

    #[tokio::test]
    async fn generated_node_ids_differ() {
        let a = Mesh::spawn(MeshConfig::default()).unwrap();
        let b = Mesh::spawn(MeshConfig::default()).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn broadcast_without_neighbors_is_counted() {
        let mesh = spawn_named("lonely");
        mesh.broadcast(json!("anyone?")).await.unwrap();

        let stats = mesh.stats().await.unwrap();
        assert_eq!(stats.router.originated, 1);
        assert_eq!(stats.router.relayed, 0);
        assert_eq!(stats.neighbors, 0);
    }

    #[tokio::test]
    async fn originate_with_zero_ttl_sends_nothing() {
        let mesh = spawn_named("a");
        let envelope = Envelope::broadcast(NodeId::from("a"), json!(1), 0);

        assert_eq!(mesh.originate(envelope).await.unwrap(), 0);
        assert_eq!(mesh.stats().await.unwrap().router.expired, 1);
    }

    #[tokio::test]
    async fn send_to_unknown_node_fails() {
        let mesh = spawn_named("a");
        let envelope = Envelope::broadcast(NodeId::from("a"), json!(1), 1);

        let err = mesh.send_to(NodeId::from("ghost"), envelope).await.unwrap_err();
        assert!(matches!(err, P2pError::UnknownNode(_)));
    }

    #[tokio::test]
    async fn listen_twice_fails_and_stop_is_idempotent() {
        let mesh = spawn_named("a");
        let listener = mesh.listen(0).await.unwrap();

        let err = mesh.listen(0).await.unwrap_err();
        assert!(matches!(err, P2pError::AlreadyListening(_)));

        assert!(listener.stop().await);
        assert!(!listener.stop().await);
        assert_eq!(mesh.stats().await.unwrap().listen_addr, None);
    }

    #[tokio::test]
    async fn listen_again_on_bound_port_reports_already_listening() {
        let mesh = spawn_named("a");
        let listener = mesh.listen(0).await.unwrap();
        let addr = listener.local_addr();

        let err = mesh.listen(addr.port()).await.unwrap_err();
        assert!(matches!(err, P2pError::AlreadyListening(a) if a == addr));
    }

    #[tokio::test]
    async fn commands_fail_after_shutdown() {
        let mesh = spawn_named("a");
        let listener = mesh.listen(0).await.unwrap();

        mesh.shutdown().await;
        mesh.shutdown().await;

        assert!(matches!(mesh.stats().await, Err(P2pError::Shutdown)));
        assert!(matches!(
            mesh.broadcast(json!(1)).await,
            Err(P2pError::Shutdown)
        ));
        assert!(!listener.stop().await);
    }

    #[tokio::test]
    async fn dropping_every_handle_releases_listener_handle() {
        let mesh = spawn_named("a");
        let listener = mesh.listen(0).await.unwrap();
        drop(mesh);

        assert!(!listener.stop().await);
    }
}
