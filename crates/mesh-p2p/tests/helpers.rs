//! Test helpers for mesh integration tests.

#![allow(dead_code)]

use std::time::Duration;

use mesh_p2p::{DisconnectHandle, ListenerHandle, Mesh, MeshConfig, MeshEvent, MeshHandle, NodeId};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout, timeout_at, Instant};

/// Default test timeout.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to watch for events that must not arrive.
pub const QUIET_WINDOW: Duration = Duration::from_millis(300);

/// A running mesh node listening on an ephemeral port.
pub struct TestNode {
    pub mesh: MeshHandle,
    pub events: broadcast::Receiver<MeshEvent>,
    pub listener: ListenerHandle,
}

impl TestNode {
    /// Starts a node with a fixed id and default config.
    pub async fn start(name: &str) -> Self {
        Self::start_with(MeshConfig::default().with_node_id(name)).await
    }

    /// Starts a node with the given config.
    pub async fn start_with(config: MeshConfig) -> Self {
        let mesh = Mesh::spawn(config).unwrap();
        let events = mesh.subscribe();
        let listener = mesh.listen(0).await.unwrap();
        Self {
            mesh,
            events,
            listener,
        }
    }

    pub fn id(&self) -> NodeId {
        self.mesh.id().clone()
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().port()
    }

    /// Dials `other` over loopback.
    pub async fn connect_to(&self, other: &TestNode) -> DisconnectHandle {
        self.mesh.connect("127.0.0.1", other.port()).await.unwrap()
    }

    /// Waits for the next event matching `pred`, skipping others.
    pub async fn wait_for(&mut self, pred: impl Fn(&MeshEvent) -> bool) -> MeshEvent {
        timeout(TEST_TIMEOUT, async {
            loop {
                let event = self.events.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for mesh event")
    }

    /// Collects every event that arrives within `window`.
    pub async fn collect_for(&mut self, window: Duration) -> Vec<MeshEvent> {
        let deadline = Instant::now() + window;
        let mut events = Vec::new();
        while let Ok(Ok(event)) = timeout_at(deadline, self.events.recv()).await {
            events.push(event);
        }
        events
    }

    /// Polls until `node` is (or is not) a neighbor.
    pub async fn wait_for_neighbor(&self, node: &NodeId, present: bool) {
        timeout(TEST_TIMEOUT, async {
            loop {
                let neighbors = self.mesh.neighbors().await.unwrap();
                if neighbors.contains(node) == present {
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for neighbor table");
    }
}

/// Connects `a` to `b` and waits until each lists the other as a neighbor.
pub async fn link(a: &TestNode, b: &TestNode) -> DisconnectHandle {
    let handle = a.connect_to(b).await;
    a.wait_for_neighbor(&b.id(), true).await;
    b.wait_for_neighbor(&a.id(), true).await;
    handle
}

pub fn is_broadcast(event: &MeshEvent) -> bool {
    matches!(event, MeshEvent::Broadcast { .. })
}

pub fn is_direct(event: &MeshEvent) -> bool {
    matches!(event, MeshEvent::Direct { .. })
}
