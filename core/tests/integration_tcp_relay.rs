// Integration test: two peers talking through the reference relay over TCP
//
// Alice reserves a route to Bob through a local relay server. Bob sees the
// inbound route, both sides exchange payloads, and closing on one side
// propagates to the other.

use circuit_relay_core::{
    CircuitRelayConfig, CircuitRelayEvent, EventSubscription, RelayServer, RelayServerConfig,
    RelayService, RelayType, RouteDirection, RouteState, TcpRelayTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay() -> (Arc<RelayServer>, String) {
    let server = Arc::new(RelayServer::with_config(RelayServerConfig {
        relay_peer_id: "relay-under-test".to_string(),
        ..Default::default()
    }));
    let (addr, _handle) = Arc::clone(&server)
        .bind("127.0.0.1:0")
        .await
        .expect("Failed to bind relay");
    (server, format!("tcp://{}", addr))
}

async fn start_peer(peer_id: &str, relay_addr: &str) -> RelayService {
    let config = CircuitRelayConfig::default()
        .with_relays(vec![relay_addr.to_string()])
        .with_local_peer_id(peer_id);
    let service =
        RelayService::new(config, Arc::new(TcpRelayTransport::new())).expect("valid config");
    service.start().await;
    service
}

async fn next_event(events: &mut EventSubscription) -> CircuitRelayEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("Timed out waiting for event")
        .expect("event bus closed")
}

#[tokio::test]
async fn test_route_and_data_over_tcp_relay() {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init()
        .ok();

    let (server, relay_addr) = start_relay().await;
    let alice = start_peer("alice", &relay_addr).await;
    let bob = start_peer("bob", &relay_addr).await;
    let mut bob_events = bob.subscribe();

    assert_eq!(alice.get_connected_relays().len(), 1);
    assert_eq!(bob.get_connected_relays().len(), 1);
    assert!(server.is_peer_connected("alice"));
    assert!(server.is_peer_connected("bob"));

    // Alice opens a route to Bob.
    let route_id = alice.create_route("bob").await.expect("route to bob");
    let alice_route = alice.get_route(&route_id).unwrap();
    assert_eq!(alice_route.state, RouteState::Active);
    assert_eq!(alice_route.direction, RouteDirection::Outbound);

    // Bob learns about it as an inbound route.
    match next_event(&mut bob_events).await {
        CircuitRelayEvent::RouteEstablished {
            route_id: inbound,
            target_peer_id,
        } => {
            assert_eq!(inbound, route_id);
            assert_eq!(target_peer_id, "alice");
        }
        other => panic!("expected inbound route, got {:?}", other),
    }
    let bob_route = bob.get_route(&route_id).unwrap();
    assert_eq!(bob_route.direction, RouteDirection::Inbound);
    assert_eq!(bob_route.state, RouteState::Active);

    // Alice -> Bob
    let mut bob_inbox = bob.subscribe_route(&route_id).unwrap();
    assert!(alice.send_message_through_route(&route_id, b"hello bob").await);
    let received = timeout(WAIT, bob_inbox.recv()).await.unwrap();
    assert_eq!(received, Some(b"hello bob".to_vec()));

    // Bob -> Alice on the same route
    let mut alice_inbox = alice.subscribe_route(&route_id).unwrap();
    assert!(bob.send_message_through_route(&route_id, b"hi alice").await);
    let received = timeout(WAIT, alice_inbox.recv()).await.unwrap();
    assert_eq!(received, Some(b"hi alice".to_vec()));

    let stats = server.get_stats();
    assert_eq!(stats.routes_active, 1);
    assert_eq!(stats.frames_forwarded, 2);

    // Alice closes; Bob sees the close.
    alice.close_route(&route_id).await;
    match next_event(&mut bob_events).await {
        CircuitRelayEvent::RouteClosed { route_id: closed } => assert_eq!(closed, route_id),
        other => panic!("expected route close, got {:?}", other),
    }
    assert_eq!(timeout(WAIT, bob_inbox.recv()).await.unwrap(), None);

    alice.stop().await;
    bob.stop().await;
}

#[tokio::test]
async fn test_reservation_to_absent_peer_rejected() {
    let (_server, relay_addr) = start_relay().await;
    let alice = start_peer("alice", &relay_addr).await;
    let mut events = alice.subscribe();

    assert!(alice.create_route("nobody").await.is_none());

    match next_event(&mut events).await {
        CircuitRelayEvent::Error { message } => {
            assert!(message.contains("target peer not connected"))
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert_eq!(alice.get_all_routes()[0].state, RouteState::Failed);
    alice.stop().await;
}

#[tokio::test]
async fn test_peer_departure_closes_route() {
    let (_server, relay_addr) = start_relay().await;
    let alice = start_peer("alice", &relay_addr).await;
    let bob = start_peer("bob", &relay_addr).await;
    let route_id = alice.create_route("bob").await.expect("route to bob");
    let mut alice_events = alice.subscribe();

    bob.stop().await;

    match next_event(&mut alice_events).await {
        CircuitRelayEvent::RouteClosed { route_id: closed } => assert_eq!(closed, route_id),
        other => panic!("expected route close, got {:?}", other),
    }
    // Alice keeps her relay connection.
    assert_eq!(alice.get_connected_relays().len(), 1);
    alice.stop().await;
}

#[tokio::test]
async fn test_latency_over_tcp() {
    let (_server, relay_addr) = start_relay().await;
    let alice = start_peer("alice", &relay_addr).await;
    let relay_id = alice.get_connected_relays()[0].id.clone();

    let rtt = alice.measure_relay_latency(&relay_id).await;

    assert!(rtt.is_some());
    alice.stop().await;
}

#[tokio::test]
async fn test_unreachable_relay_reports_error() {
    let (_server, relay_addr) = start_relay().await;
    let alice = start_peer("alice", &relay_addr).await;
    let mut events = alice.subscribe();

    let dead = alice
        .add_relay("tcp://127.0.0.1:1", RelayType::Public)
        .expect("relay added");
    assert!(!alice.connect_to_relay(&dead).await);

    assert!(matches!(
        next_event(&mut events).await,
        CircuitRelayEvent::Error { .. }
    ));
    assert_eq!(alice.get_connected_relays().len(), 1);
    alice.stop().await;
}
