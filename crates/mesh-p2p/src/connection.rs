//! TCP connection management.
//!
//! This module owns the raw sockets of the mesh:
//! - [`ConnectionManager`]: the connection table plus listen/connect/send/close
//! - [`FrameSink`]: the seam upper layers use to write frames
//! - per-connection tasks that split a socket into a line reader and writer
//!
//! Inbound and outbound sockets are registered identically. Socket tasks never
//! touch the table: they report through [`TransportEvent`]s, which the owner of
//! the manager feeds back into [`ConnectionManager::handle_transport_event`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::codec::{LineFrameCodec, RawLine};
use crate::error::{P2pError, P2pResult};
use crate::protocol::{ConnectionId, Frame};

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by our listener.
    Inbound,
    /// Dialed by us.
    Outbound,
}

/// Snapshot of a registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection id.
    pub id: ConnectionId,
    /// Remote socket address.
    pub remote_addr: SocketAddr,
    /// Who opened the connection.
    pub direction: Direction,
    /// When the connection was registered.
    pub connected_at: DateTime<Utc>,
}

/// Raw notifications from listener and socket tasks.
#[derive(Debug)]
pub enum TransportEvent {
    /// The listener accepted a socket that still needs registering.
    Accepted {
        /// The accepted stream.
        stream: TcpStream,
        /// Remote address of the stream.
        remote_addr: SocketAddr,
    },
    /// A line on a connection parsed as a frame.
    Frame {
        /// Connection the frame arrived on.
        connection_id: ConnectionId,
        /// The parsed frame.
        frame: Frame,
    },
    /// A socket task finished (EOF, IO error, or close).
    Closed {
        /// The connection that ended.
        connection_id: ConnectionId,
    },
}

/// Connection-level events consumed by the node directory.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A connection was registered.
    Connected(ConnectionId),
    /// A frame arrived on a registered connection.
    Message {
        /// Connection the frame arrived on.
        connection_id: ConnectionId,
        /// The parsed frame.
        frame: Frame,
    },
    /// A registered connection went away. Emitted once per connection.
    Disconnected(ConnectionId),
}

/// Writes frames to connections by id.
pub trait FrameSink {
    /// Queues `frame` for the connection.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::UnknownConnection`] if the connection is not
    /// registered.
    fn send_frame(&mut self, connection_id: ConnectionId, frame: &Frame) -> P2pResult<()>;
}

/// Table entry for a live connection.
#[derive(Debug)]
struct ConnectionHandle {
    info: ConnectionInfo,
    outbound: mpsc::Sender<String>,
    /// Dropping this ends the socket task.
    _close: oneshot::Sender<()>,
}

#[derive(Debug)]
struct ListenerState {
    local_addr: SocketAddr,
    /// Dropping this ends the accept task.
    _stop: oneshot::Sender<()>,
}

/// Configuration for the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionManagerConfig {
    /// Longest accepted line in bytes. Longer lines are dropped.
    pub max_frame_length: usize,
    /// Frames queued per connection.
    pub outbound_buffer: usize,
    /// Timeout for outbound connects.
    pub connect_timeout: Duration,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self {
            max_frame_length: crate::config::DEFAULT_MAX_FRAME_LENGTH,
            outbound_buffer: 256,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Owns every live connection and the optional listener.
#[derive(Debug)]
pub struct ConnectionManager {
    config: ConnectionManagerConfig,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    listener: Option<ListenerState>,
    events: mpsc::Sender<TransportEvent>,
}

impl ConnectionManager {
    /// Creates a manager whose tasks report to `events`.
    #[must_use]
    pub fn new(config: ConnectionManagerConfig, events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            config,
            connections: HashMap::new(),
            listener: None,
            events,
        }
    }

    /// Returns the manager configuration.
    #[must_use]
    pub const fn config(&self) -> &ConnectionManagerConfig {
        &self.config
    }

    /// Returns the number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns true if no connection is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Returns true if the connection is registered.
    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Returns info about a registered connection.
    #[must_use]
    pub fn info(&self, connection_id: &ConnectionId) -> Option<&ConnectionInfo> {
        self.connections.get(connection_id).map(|c| &c.info)
    }

    /// Returns info about every registered connection.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections.values().map(|c| c.info.clone()).collect()
    }

    /// Returns the bound listener address, if listening.
    #[must_use]
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr)
    }

    /// Binds `0.0.0.0:port` and starts accepting.
    ///
    /// # Errors
    ///
    /// Returns an error if already listening or binding fails.
    pub async fn listen(&mut self, port: u16) -> P2pResult<SocketAddr> {
        if let Some(addr) = self.listen_addr() {
            return Err(P2pError::AlreadyListening(addr));
        }
        let listener = bind_listener(port).await?;
        self.start_listener(listener)
    }

    /// Starts accepting on an already bound listener.
    ///
    /// Accepted sockets arrive as [`TransportEvent::Accepted`] and are
    /// registered by [`handle_transport_event`](Self::handle_transport_event).
    ///
    /// # Errors
    ///
    /// Returns an error if already listening.
    pub fn start_listener(&mut self, listener: TcpListener) -> P2pResult<SocketAddr> {
        if let Some(addr) = self.listen_addr() {
            return Err(P2pError::AlreadyListening(addr));
        }
        let local_addr = listener.local_addr()?;
        let (stop_tx, stop_rx) = oneshot::channel();

        tokio::spawn(accept_loop(listener, self.events.clone(), stop_rx));
        info!(addr = %local_addr, "Mesh listener started");

        self.listener = Some(ListenerState {
            local_addr,
            _stop: stop_tx,
        });
        Ok(local_addr)
    }

    /// Stops the listener. Returns false if there was none.
    pub fn stop_listener(&mut self) -> bool {
        match self.listener.take() {
            Some(listener) => {
                info!(addr = %listener.local_addr, "Mesh listener stopped");
                true
            }
            None => false,
        }
    }

    /// Stops the listener only if it is bound to `addr`.
    ///
    /// Used by stale listener handles so they never stop a newer listener.
    pub fn stop_listener_at(&mut self, addr: SocketAddr) -> bool {
        if self.listen_addr() == Some(addr) {
            self.stop_listener()
        } else {
            false
        }
    }

    /// Dials `host:port` and registers the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the connect fails or times out.
    pub async fn connect(&mut self, host: &str, port: u16) -> P2pResult<ConnectionEvent> {
        let stream = dial(host, port, self.config.connect_timeout).await?;
        let remote_addr = stream.peer_addr()?;
        Ok(self.register(stream, remote_addr, Direction::Outbound))
    }

    /// Registers a socket and spawns its reader/writer task.
    ///
    /// Returns the [`ConnectionEvent::Connected`] event for the new id.
    pub fn register(
        &mut self,
        stream: TcpStream,
        remote_addr: SocketAddr,
        direction: Direction,
    ) -> ConnectionEvent {
        let id = ConnectionId::new();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(connection_id = %id, error = %e, "Failed to set TCP_NODELAY");
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_buffer);
        let (close_tx, close_rx) = oneshot::channel();

        tokio::spawn(run_connection(
            id,
            stream,
            self.config.max_frame_length,
            outbound_rx,
            close_rx,
            self.events.clone(),
        ));

        info!(connection_id = %id, peer = %remote_addr, ?direction, "Connection registered");

        self.connections.insert(
            id,
            ConnectionHandle {
                info: ConnectionInfo {
                    id,
                    remote_addr,
                    direction,
                    connected_at: Utc::now(),
                },
                outbound: outbound_tx,
                _close: close_tx,
            },
        );
        ConnectionEvent::Connected(id)
    }

    /// Serializes `frame` and queues it for the connection.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::UnknownConnection`] for unregistered connections and
    /// [`P2pError::Backpressure`] when the connection's queue is full.
    pub fn send(&self, connection_id: ConnectionId, frame: &Frame) -> P2pResult<()> {
        let handle = self
            .connections
            .get(&connection_id)
            .ok_or(P2pError::UnknownConnection(connection_id))?;

        let line = frame.to_line()?;
        handle.outbound.try_send(line).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => P2pError::Backpressure(connection_id),
            mpsc::error::TrySendError::Closed(_) => P2pError::UnknownConnection(connection_id),
        })
    }

    /// Forcibly closes one connection.
    ///
    /// Returns the [`ConnectionEvent::Disconnected`] event if the connection
    /// was registered, `None` if it was already gone.
    pub fn close(&mut self, connection_id: ConnectionId) -> Option<ConnectionEvent> {
        self.connections.remove(&connection_id).map(|handle| {
            info!(connection_id = %connection_id, peer = %handle.info.remote_addr, "Connection closed");
            ConnectionEvent::Disconnected(connection_id)
        })
    }

    /// Closes every connection and stops the listener.
    ///
    /// Returns one disconnect event per connection that was open.
    pub fn close_all(&mut self) -> Vec<ConnectionEvent> {
        self.stop_listener();
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.into_iter().filter_map(|id| self.close(id)).collect()
    }

    /// Applies a transport notification to the table.
    ///
    /// Returns the resulting connection event, or `None` when the
    /// notification concerns a connection that is no longer registered.
    pub fn handle_transport_event(&mut self, event: TransportEvent) -> Option<ConnectionEvent> {
        match event {
            TransportEvent::Accepted {
                stream,
                remote_addr,
            } => Some(self.register(stream, remote_addr, Direction::Inbound)),
            TransportEvent::Frame {
                connection_id,
                frame,
            } => {
                if self.contains(&connection_id) {
                    Some(ConnectionEvent::Message {
                        connection_id,
                        frame,
                    })
                } else {
                    trace!(connection_id = %connection_id, "Frame from closed connection ignored");
                    None
                }
            }
            TransportEvent::Closed { connection_id } => self
                .connections
                .remove(&connection_id)
                .map(|handle| {
                    info!(connection_id = %connection_id, peer = %handle.info.remote_addr, "Connection ended");
                    ConnectionEvent::Disconnected(connection_id)
                }),
        }
    }
}

impl FrameSink for ConnectionManager {
    fn send_frame(&mut self, connection_id: ConnectionId, frame: &Frame) -> P2pResult<()> {
        self.send(connection_id, frame)
    }
}

/// Binds a TCP listener on all interfaces.
///
/// # Errors
///
/// Returns an error if the port cannot be bound.
pub async fn bind_listener(port: u16) -> P2pResult<TcpListener> {
    Ok(TcpListener::bind(("0.0.0.0", port)).await?)
}

/// Opens an outbound TCP connection with a timeout.
///
/// # Errors
///
/// Returns an error if the connect fails or times out.
pub async fn dial(host: &str, port: u16, connect_timeout: Duration) -> P2pResult<TcpStream> {
    debug!(host, port, "Connecting");
    match tokio::time::timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(P2pError::ConnectTimeout(format!("{host}:{port}"))),
    }
}

async fn accept_loop(
    listener: TcpListener,
    events: mpsc::Sender<TransportEvent>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, remote_addr)) => {
                        debug!(peer = %remote_addr, "Accepted connection");
                        if events.send(TransportEvent::Accepted { stream, remote_addr }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = &mut stop_rx => break,
        }
    }
}

async fn run_connection(
    id: ConnectionId,
    stream: TcpStream,
    max_frame_length: usize,
    mut outbound_rx: mpsc::Receiver<String>,
    mut close_rx: oneshot::Receiver<()>,
    events: mpsc::Sender<TransportEvent>,
) {
    let framed = Framed::new(stream, LineFrameCodec::new(max_frame_length));
    let (mut sink, mut lines) = framed.split();

    loop {
        tokio::select! {
            line = lines.next() => {
                match line {
                    Some(Ok(RawLine::Line(line))) => match Frame::from_slice(&line) {
                        Ok(frame) => {
                            let event = TransportEvent::Frame { connection_id: id, frame };
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            trace!(connection_id = %id, error = %e, "Dropping malformed frame");
                        }
                    },
                    Some(Ok(RawLine::Oversized)) => {
                        warn!(connection_id = %id, limit = max_frame_length, "Dropping oversized frame");
                    }
                    Some(Err(e)) => {
                        debug!(connection_id = %id, error = %e, "Connection read error");
                        break;
                    }
                    None => break,
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(line) => {
                        if let Err(e) = sink.send(line).await {
                            debug!(connection_id = %id, error = %e, "Connection write error");
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = &mut close_rx => break,
        }
    }

    let _ = events.send(TransportEvent::Closed { connection_id: id }).await;
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
