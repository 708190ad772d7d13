//! End-to-end tests for the gossip mesh over loopback TCP.
//!
//! These tests verify:
//! 1. Handshake exchange and neighbor tables
//! 2. Broadcast reachability and duplicate suppression
//! 3. TTL exhaustion
//! 4. Direct messages relayed through an intermediate node
//! 5. Disconnect cleanup and idempotent close

mod helpers;

use helpers::{is_broadcast, is_direct, link, TestNode, QUIET_WINDOW};
use mesh_p2p::{Envelope, MeshEvent, P2pError};
use serde_json::json;

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn handshake_round_trip() {
    let mut a = TestNode::start("a").await;
    let mut b = TestNode::start("b").await;

    a.connect_to(&b).await;

    let at_a = a
        .wait_for(|e| matches!(e, MeshEvent::NodeConnected { .. }))
        .await;
    let at_b = b
        .wait_for(|e| matches!(e, MeshEvent::NodeConnected { .. }))
        .await;

    assert_eq!(at_a, MeshEvent::NodeConnected { node_id: b.id() });
    assert_eq!(at_b, MeshEvent::NodeConnected { node_id: a.id() });
    assert_eq!(a.mesh.neighbors().await.unwrap(), vec![b.id()]);
    assert_eq!(b.mesh.neighbors().await.unwrap(), vec![a.id()]);
}

#[tokio::test]
async fn connection_info_reports_direction() {
    let a = TestNode::start("a").await;
    let b = TestNode::start("b").await;
    let handle = link(&a, &b).await;

    let at_a = a.mesh.connections().await.unwrap();
    let at_b = b.mesh.connections().await.unwrap();

    assert_eq!(at_a.len(), 1);
    assert_eq!(at_a[0].id, handle.connection_id());
    assert_eq!(at_a[0].direction, mesh_p2p::Direction::Outbound);
    assert_eq!(at_b[0].direction, mesh_p2p::Direction::Inbound);
}

// ============================================================================
// Broadcast
// ============================================================================

#[tokio::test]
async fn broadcast_reaches_every_node_once_in_full_mesh() {
    let mut nodes = Vec::new();
    for name in ["a", "b", "c", "d"] {
        nodes.push(TestNode::start(name).await);
    }
    for i in 0..nodes.len() {
        for j in (i + 1)..nodes.len() {
            link(&nodes[i], &nodes[j]).await;
        }
    }

    let origin = nodes[0].id();
    let envelope = Envelope::broadcast(origin.clone(), json!({"price": 42}), 3);
    assert_eq!(nodes[0].mesh.originate(envelope).await.unwrap(), 3);

    for node in &mut nodes[1..] {
        let event = node.wait_for(is_broadcast).await;
        assert_eq!(
            event,
            MeshEvent::Broadcast {
                message: json!({"price": 42}),
                origin: origin.clone(),
            }
        );
    }

    for node in &mut nodes {
        let late = node.collect_for(QUIET_WINDOW).await;
        assert!(!late.iter().any(is_broadcast), "duplicate delivery: {late:?}");

        let stats = node.mesh.stats().await.unwrap();
        assert!(stats.router.relayed <= stats.neighbors as u64);
    }
}

#[tokio::test]
async fn ttl_one_reaches_only_direct_neighbors() {
    let a = TestNode::start("a").await;
    let mut b = TestNode::start("b").await;
    let mut c = TestNode::start("c").await;
    link(&a, &b).await;
    link(&b, &c).await;

    let envelope = Envelope::broadcast(a.id(), json!("near"), 1);
    a.mesh.originate(envelope).await.unwrap();

    b.wait_for(is_broadcast).await;
    let at_c = c.collect_for(QUIET_WINDOW).await;
    assert!(!at_c.iter().any(is_broadcast));
    assert_eq!(b.mesh.stats().await.unwrap().router.relayed, 0);
}

#[tokio::test]
async fn default_broadcast_travels_a_line() {
    let a = TestNode::start("a").await;
    let b = TestNode::start("b").await;
    let mut c = TestNode::start("c").await;
    link(&a, &b).await;
    link(&b, &c).await;

    a.mesh.broadcast(json!("far")).await.unwrap();

    let event = c.wait_for(is_broadcast).await;
    assert_eq!(
        event,
        MeshEvent::Broadcast {
            message: json!("far"),
            origin: a.id(),
        }
    );
}

// ============================================================================
// Direct messages
// ============================================================================

#[tokio::test]
async fn direct_message_is_relayed_through_intermediate() {
    let a = TestNode::start("a").await;
    let mut b = TestNode::start("b").await;
    let mut c = TestNode::start("c").await;
    link(&a, &b).await;
    link(&b, &c).await;

    a.mesh.direct(c.id(), json!("for c only")).await.unwrap();

    let event = c.wait_for(is_direct).await;
    assert_eq!(
        event,
        MeshEvent::Direct {
            origin: a.id(),
            message: json!("for c only"),
        }
    );

    let at_b = b.collect_for(QUIET_WINDOW).await;
    assert!(!at_b.iter().any(is_direct));
    assert!(!c.collect_for(QUIET_WINDOW).await.iter().any(is_direct));
}

#[tokio::test]
async fn send_to_neighbor_is_routed_on_arrival() {
    let a = TestNode::start("a").await;
    let mut b = TestNode::start("b").await;
    link(&a, &b).await;

    let envelope = Envelope::broadcast(a.id(), json!(7), 1);
    a.mesh.send_to(b.id(), envelope).await.unwrap();

    assert_eq!(
        b.wait_for(is_broadcast).await,
        MeshEvent::Broadcast {
            message: json!(7),
            origin: a.id(),
        }
    );
}

#[tokio::test]
async fn send_to_stranger_fails() {
    let a = TestNode::start("a").await;
    let envelope = Envelope::broadcast(a.id(), json!(7), 1);

    let err = a.mesh.send_to("nobody".into(), envelope).await.unwrap_err();
    assert!(matches!(err, P2pError::UnknownNode(_)));
}

// ============================================================================
// Disconnect and close
// ============================================================================

#[tokio::test]
async fn disconnect_removes_neighbor_once() {
    let mut a = TestNode::start("a").await;
    let mut b = TestNode::start("b").await;
    let handle = link(&a, &b).await;

    assert!(handle.disconnect().await);
    assert!(!handle.disconnect().await);

    assert_eq!(
        a.wait_for(|e| matches!(e, MeshEvent::NodeDisconnected { .. }))
            .await,
        MeshEvent::NodeDisconnected { node_id: b.id() }
    );
    assert_eq!(
        b.wait_for(|e| matches!(e, MeshEvent::NodeDisconnected { .. }))
            .await,
        MeshEvent::NodeDisconnected { node_id: a.id() }
    );

    for node in [&mut a, &mut b] {
        let late = node.collect_for(QUIET_WINDOW).await;
        assert!(
            !late
                .iter()
                .any(|e| matches!(e, MeshEvent::NodeDisconnected { .. })),
            "duplicate disconnect: {late:?}"
        );
    }
    assert!(a.mesh.neighbors().await.unwrap().is_empty());
    assert!(b.mesh.neighbors().await.unwrap().is_empty());
}

#[tokio::test]
async fn close_is_idempotent() {
    let a = TestNode::start("a").await;
    let mut b = TestNode::start("b").await;
    link(&a, &b).await;

    a.mesh.close().await.unwrap();
    a.mesh.close().await.unwrap();

    b.wait_for(|e| matches!(e, MeshEvent::NodeDisconnected { .. }))
        .await;
    let stats = a.mesh.stats().await.unwrap();
    assert_eq!(stats.connections, 0);
    assert_eq!(stats.listen_addr, None);
}

#[tokio::test]
async fn shutdown_disconnects_peers() {
    let a = TestNode::start("a").await;
    let mut b = TestNode::start("b").await;
    link(&a, &b).await;

    a.mesh.shutdown().await;

    assert_eq!(
        b.wait_for(|e| matches!(e, MeshEvent::NodeDisconnected { .. }))
            .await,
        MeshEvent::NodeDisconnected { node_id: a.id() }
    );
    assert!(matches!(a.mesh.stats().await, Err(P2pError::Shutdown)));
}

#[tokio::test]
async fn self_dial_never_becomes_a_neighbor() {
    let mut a = TestNode::start("a").await;
    a.connect_to(&a).await;

    let events = a.collect_for(QUIET_WINDOW).await;
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, MeshEvent::NodeConnected { .. }))
    );
    assert!(a.mesh.neighbors().await.unwrap().is_empty());
    assert_eq!(a.mesh.connections().await.unwrap().len(), 2);
}
