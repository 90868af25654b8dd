// Integration test: relay service behavior against scripted in-memory relays
//
// Covers registry rules, connection capacity, route lifecycle, event ordering
// on disconnect, and the seed-relay startup path.

use circuit_relay_core::testing::{
    HandshakeBehavior, MemoryTransport, RelayBehavior, ReservationBehavior,
};
use circuit_relay_core::{
    CircuitRelayConfig, CircuitRelayEvent, EventListener, RelayFrame, RelayService, RelayType,
    RouteId, RouteState,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init()
        .ok();
}

fn quiet_config() -> CircuitRelayConfig {
    CircuitRelayConfig {
        enable_auto_relay: false,
        auto_start: false,
        ..Default::default()
    }
}

fn service_with(config: CircuitRelayConfig) -> (RelayService, Arc<MemoryTransport>) {
    init_logging();
    let transport = Arc::new(MemoryTransport::new());
    let service = RelayService::new(config, transport.clone()).expect("valid config");
    (service, transport)
}

/// Records event types in delivery order
#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<CircuitRelayEvent>>,
}

impl EventListener for EventLog {
    fn on_event(&self, event: &CircuitRelayEvent) {
        self.events.lock().push(event.clone());
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

#[tokio::test]
async fn test_add_relay_creates_one_entry() {
    let (service, _) = service_with(quiet_config());

    let id = service
        .add_relay("relay.example:4000", RelayType::Public)
        .expect("relay added");

    let relays = service.get_all_relays();
    assert_eq!(relays.len(), 1);
    assert_eq!(relays[0].id, id);
    assert_eq!(relays[0].address, "relay.example:4000");
    assert_eq!(relays[0].relay_type, RelayType::Public);
    assert!(!relays[0].is_connected);

    let other = service
        .add_relay("relay.example:4000", RelayType::Public)
        .expect("duplicates allowed by default");
    assert_ne!(id, other);
}

#[tokio::test]
async fn test_unique_address_policy_rejects_duplicates() {
    let (service, _) = service_with(CircuitRelayConfig {
        unique_relay_addresses: true,
        ..quiet_config()
    });
    let mut events = service.subscribe();

    assert!(service.add_relay("relay:1", RelayType::Public).is_some());
    assert!(service.add_relay("relay:1", RelayType::Private).is_none());

    assert_eq!(service.get_all_relays().len(), 1);
    assert!(matches!(
        events.try_recv(),
        Some(CircuitRelayEvent::Error { .. })
    ));
}

#[tokio::test]
async fn test_remove_bootstrap_relay_is_noop() {
    let (service, _) = service_with(quiet_config().with_relays(vec!["seed:1".to_string()]));
    let seed = service.get_all_relays()[0].id.clone();

    service.remove_relay(&seed).await;

    assert_eq!(service.get_all_relays().len(), 1);
}

#[tokio::test]
async fn test_remove_connected_relay_disconnects_first() {
    let (service, transport) = service_with(quiet_config());
    service.start().await;
    let id = service.add_relay("relay:1", RelayType::Public).unwrap();
    assert!(service.connect_to_relay(&id).await);
    let route = service.create_route("peerB").await.unwrap();

    service.remove_relay(&id).await;

    assert!(service.get_all_relays().is_empty());
    assert!(transport.link(&id).unwrap().is_closed());
    assert_eq!(service.get_route(&route).unwrap().state, RouteState::Closed);
    service.stop().await;
}

// ============================================================================
// CONNECTIONS
// ============================================================================

#[tokio::test]
async fn test_connect_and_disconnect() {
    let (service, _) = service_with(quiet_config());
    service.start().await;
    let id = service.add_relay("relay:1", RelayType::Public).unwrap();

    assert!(service.connect_to_relay(&id).await);
    let connected = service.get_connected_relays();
    assert_eq!(connected.len(), 1);
    assert!(connected[0].connected_at.is_some());

    service.disconnect_from_relay(&id).await;
    assert!(service.get_connected_relays().is_empty());
    service.stop().await;
}

#[tokio::test]
async fn test_connect_already_connected_reuses_link() {
    let (service, transport) = service_with(quiet_config());
    let id = service.add_relay("relay:1", RelayType::Public).unwrap();

    assert!(service.connect_to_relay(&id).await);
    assert!(service.connect_to_relay(&id).await);

    assert_eq!(transport.connect_count("relay:1"), 1);
}

#[tokio::test]
async fn test_connect_unknown_relay_fails() {
    let (service, _) = service_with(quiet_config());
    let mut events = service.subscribe();

    assert!(!service.connect_to_relay(&"missing".into()).await);
    assert!(matches!(
        events.try_recv(),
        Some(CircuitRelayEvent::Error { .. })
    ));
}

#[tokio::test]
async fn test_capacity_limit() {
    let (service, _) = service_with(quiet_config().with_max_relays(2));
    let a = service.add_relay("relay:a", RelayType::Public).unwrap();
    let b = service.add_relay("relay:b", RelayType::Public).unwrap();
    let c = service.add_relay("relay:c", RelayType::Public).unwrap();

    assert!(service.connect_to_relay(&a).await);
    assert!(service.connect_to_relay(&b).await);
    assert!(!service.connect_to_relay(&c).await);

    let connected: Vec<_> = service
        .get_connected_relays()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(connected.len(), 2);
    assert!(connected.contains(&a));
    assert!(connected.contains(&b));
}

#[tokio::test(start_paused = true)]
async fn test_handshake_timeout() {
    let (service, transport) = service_with(quiet_config());
    transport.set_behavior(
        "relay:slow",
        RelayBehavior {
            handshake: HandshakeBehavior::Hang,
            ..Default::default()
        },
    );
    let id = service.add_relay("relay:slow", RelayType::Public).unwrap();
    let mut events = service.subscribe();

    assert!(!service.connect_to_relay(&id).await);

    assert!(service.get_connected_relays().is_empty());
    match events.try_recv() {
        Some(CircuitRelayEvent::Error { message }) => assert!(message.contains("timed out")),
        other => panic!("expected timeout error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_relay_side_link_loss() {
    let (service, transport) = service_with(quiet_config());
    service.start().await;
    let id = service.add_relay("relay:1", RelayType::Public).unwrap();
    service.connect_to_relay(&id).await;
    let route = service.create_route("peerB").await.unwrap();
    let mut events = service.subscribe();

    transport.link(&id).unwrap().sever();

    assert_eq!(
        events.recv().await,
        Some(CircuitRelayEvent::RouteClosed {
            route_id: route.clone()
        })
    );
    assert_eq!(
        events.recv().await,
        Some(CircuitRelayEvent::RelayDisconnected { relay_id: id })
    );
    assert!(service.get_active_routes().is_empty());
    service.stop().await;
}

#[tokio::test]
async fn test_frames_from_disconnected_link_are_dropped() {
    let (service, transport) = service_with(quiet_config());
    service.start().await;
    let id = service.add_relay("relay:1", RelayType::Public).unwrap();
    service.connect_to_relay(&id).await;
    let link = transport.link(&id).unwrap();

    link.inject(RelayFrame::IncomingRoute {
        route_id: RouteId::from("in-1"),
        source_peer_id: "peerC".to_string(),
    });
    service.disconnect_from_relay(&id).await;
    link.inject(RelayFrame::IncomingRoute {
        route_id: RouteId::from("in-2"),
        source_peer_id: "peerC".to_string(),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(service.get_active_routes().is_empty());
    if let Some(route) = service.get_route(&RouteId::from("in-1")) {
        assert_eq!(route.state, RouteState::Closed);
    }
    assert!(service.get_route(&RouteId::from("in-2")).is_none());
    service.stop().await;
}

#[tokio::test]
async fn test_stale_link_close_ignored_after_reconnect() {
    let (service, transport) = service_with(quiet_config());
    service.start().await;
    let id = service.add_relay("relay:1", RelayType::Public).unwrap();
    service.connect_to_relay(&id).await;

    transport.link(&id).unwrap().sever();
    service.disconnect_from_relay(&id).await;
    assert!(service.connect_to_relay(&id).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(service.get_connected_relays().len(), 1);
    let route = service.create_route("peerB").await;
    assert!(route.is_some());
    assert_eq!(service.get_active_routes().len(), 1);
    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_connect_releases_capacity() {
    let (service, transport) = service_with(CircuitRelayConfig {
        max_relays: 1,
        ..quiet_config()
    });
    transport.set_behavior(
        "relay:slow",
        RelayBehavior {
            handshake: HandshakeBehavior::Hang,
            ..Default::default()
        },
    );
    service.start().await;
    let slow = service.add_relay("relay:slow", RelayType::Public).unwrap();
    let fast = service.add_relay("relay:fast", RelayType::Public).unwrap();

    let cancelled =
        tokio::time::timeout(Duration::from_millis(100), service.connect_to_relay(&slow)).await;
    assert!(cancelled.is_err());

    assert!(service.connect_to_relay(&fast).await);
    service.disconnect_from_relay(&fast).await;

    // A fresh attempt runs to its own timeout instead of waiting forever.
    assert!(!service.connect_to_relay(&slow).await);
    assert_eq!(transport.connect_count("relay:slow"), 2);
    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_reservation_does_not_stay_pending() {
    let (service, transport) = service_with(quiet_config());
    transport.set_behavior(
        "relay:silent",
        RelayBehavior {
            reservation: ReservationBehavior::Ignore,
            ..Default::default()
        },
    );
    service.start().await;
    let id = service.add_relay("relay:silent", RelayType::Public).unwrap();
    service.connect_to_relay(&id).await;

    let abandoned =
        tokio::time::timeout(Duration::from_millis(100), service.create_route("peerB")).await;
    assert!(abandoned.is_err());
    assert_eq!(service.get_all_routes()[0].state, RouteState::Failed);

    // A caller that joined an abandoned reservation is released too.
    let (creator, joiner) = tokio::join!(
        tokio::time::timeout(Duration::from_millis(100), service.create_route("peerB")),
        service.create_route("peerB")
    );
    assert!(creator.is_err());
    assert!(joiner.is_none());

    tokio::time::sleep(Duration::from_secs(3600)).await;
    let routes = service.get_all_routes();
    assert_eq!(routes.len(), 2);
    assert!(routes.iter().all(|r| r.state == RouteState::Failed));
    service.stop().await;
}

// ============================================================================
// ROUTES
// ============================================================================

#[tokio::test]
async fn test_create_route_without_relay() {
    let (service, _) = service_with(quiet_config());
    service.start().await;
    let mut events = service.subscribe();

    assert!(service.create_route("peerB").await.is_none());

    assert!(service.get_all_routes().is_empty());
    match events.try_recv() {
        Some(CircuitRelayEvent::Error { message }) => {
            assert!(message.contains("No connected relay"))
        }
        other => panic!("expected error, got {:?}", other),
    }
    service.stop().await;
}

#[tokio::test]
async fn test_create_route_reuses_active_route() {
    let (service, transport) = service_with(quiet_config());
    service.start().await;
    let id = service.add_relay("relay:1", RelayType::Public).unwrap();
    service.connect_to_relay(&id).await;

    let first = service.create_route("peerB").await.unwrap();
    let second = service.create_route("peerB").await.unwrap();

    assert_eq!(first, second);
    let reserves = transport
        .link(&id)
        .unwrap()
        .sent_frames()
        .into_iter()
        .filter(|f| matches!(f, RelayFrame::Reserve { .. }))
        .count();
    assert_eq!(reserves, 1);
    service.stop().await;
}

#[tokio::test]
async fn test_rejected_reservation() {
    let (service, transport) = service_with(quiet_config());
    transport.set_behavior(
        "relay:picky",
        RelayBehavior {
            reservation: ReservationBehavior::Reject("target peer not connected".to_string()),
            ..Default::default()
        },
    );
    service.start().await;
    let id = service.add_relay("relay:picky", RelayType::Public).unwrap();
    service.connect_to_relay(&id).await;
    let mut events = service.subscribe();

    assert!(service.create_route("peerB").await.is_none());

    let routes = service.get_all_routes();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].state, RouteState::Failed);
    match events.try_recv() {
        Some(CircuitRelayEvent::Error { message }) => {
            assert!(message.contains("target peer not connected"))
        }
        other => panic!("expected rejection error, got {:?}", other),
    }
    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_reservation_timeout() {
    let (service, transport) = service_with(quiet_config());
    transport.set_behavior(
        "relay:silent",
        RelayBehavior {
            reservation: ReservationBehavior::Ignore,
            ..Default::default()
        },
    );
    service.start().await;
    let id = service.add_relay("relay:silent", RelayType::Public).unwrap();
    service.connect_to_relay(&id).await;

    assert!(service.create_route("peerB").await.is_none());

    assert_eq!(service.get_all_routes()[0].state, RouteState::Failed);
    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_create_route_joins_reservation() {
    let (service, transport) = service_with(quiet_config());
    transport.set_behavior(
        "relay:1",
        RelayBehavior {
            reservation: ReservationBehavior::Ignore,
            ..Default::default()
        },
    );
    service.start().await;
    let id = service.add_relay("relay:1", RelayType::Public).unwrap();
    service.connect_to_relay(&id).await;
    let link = transport.link(&id).unwrap();

    let ack = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let route_id = link
            .sent_frames()
            .into_iter()
            .find_map(|f| match f {
                RelayFrame::Reserve { route_id, .. } => Some(route_id),
                _ => None,
            })
            .expect("reserve sent");
        link.inject(RelayFrame::ReserveAck { route_id });
    };
    let (a, b, ()) = tokio::join!(
        service.create_route("peerB"),
        service.create_route("peerB"),
        ack
    );

    assert!(a.is_some());
    assert_eq!(a, b);
    assert_eq!(service.get_all_routes().len(), 1);
    service.stop().await;
}

#[tokio::test]
async fn test_close_route_twice_emits_once() {
    let (service, transport) = service_with(quiet_config());
    service.start().await;
    let id = service.add_relay("relay:1", RelayType::Public).unwrap();
    service.connect_to_relay(&id).await;
    let route = service.create_route("peerB").await.unwrap();
    let mut events = service.subscribe();

    service.close_route(&route).await;
    service.close_route(&route).await;

    assert_eq!(
        events.drain(),
        vec![CircuitRelayEvent::RouteClosed {
            route_id: route.clone()
        }]
    );
    assert!(transport
        .link(&id)
        .unwrap()
        .sent_frames()
        .contains(&RelayFrame::CloseRoute { route_id: route }));
    service.stop().await;
}

#[tokio::test]
async fn test_remote_close() {
    let (service, transport) = service_with(quiet_config());
    service.start().await;
    let id = service.add_relay("relay:1", RelayType::Public).unwrap();
    service.connect_to_relay(&id).await;
    let route = service.create_route("peerB").await.unwrap();
    let mut events = service.subscribe();

    transport.link(&id).unwrap().inject(RelayFrame::CloseRoute {
        route_id: route.clone(),
    });

    assert_eq!(
        events.recv().await,
        Some(CircuitRelayEvent::RouteClosed { route_id: route.clone() })
    );
    assert_eq!(service.get_route(&route).unwrap().state, RouteState::Closed);
    service.stop().await;
}

// ============================================================================
// MESSAGES
// ============================================================================

#[tokio::test]
async fn test_send_requires_active_route() {
    let (service, _) = service_with(quiet_config());
    service.start().await;
    let id = service.add_relay("relay:1", RelayType::Public).unwrap();
    service.connect_to_relay(&id).await;

    assert!(!service
        .send_message_through_route(&RouteId::from("unknown"), b"hi")
        .await);

    let route = service.create_route("peerB").await.unwrap();
    assert!(service.send_message_through_route(&route, b"hi").await);

    service.close_route(&route).await;
    assert!(!service.send_message_through_route(&route, b"hi").await);
    service.stop().await;
}

#[tokio::test]
async fn test_inbound_data_reaches_route_subscriber() {
    let (service, transport) = service_with(quiet_config());
    service.start().await;
    let id = service.add_relay("relay:1", RelayType::Public).unwrap();
    service.connect_to_relay(&id).await;
    let route = service.create_route("peerB").await.unwrap();
    let mut inbox = service.subscribe_route(&route).unwrap();

    transport.link(&id).unwrap().inject(RelayFrame::Data {
        route_id: route.clone(),
        payload: b"pong".to_vec(),
    });

    assert_eq!(inbox.recv().await, Some(b"pong".to_vec()));

    service.disconnect_from_relay(&id).await;
    assert_eq!(inbox.recv().await, None);
    service.stop().await;
}

#[tokio::test]
async fn test_latency_probe() {
    let (service, _) = service_with(quiet_config());
    service.start().await;
    let id = service.add_relay("relay:1", RelayType::Public).unwrap();
    service.connect_to_relay(&id).await;

    let rtt = service.measure_relay_latency(&id).await;

    assert!(rtt.is_some());
    assert_eq!(service.get_connected_relays()[0].latency, rtt);
    service.stop().await;
}

// ============================================================================
// END TO END
// ============================================================================

#[tokio::test]
async fn test_end_to_end_seed_route_disconnect() {
    let (service, _) = service_with(
        CircuitRelayConfig::default().with_relays(vec!["relay.example:1234".to_string()]),
    );
    let log = Arc::new(EventLog::default());
    service.add_listener(log.clone());

    service.start().await;

    let connected = service.get_connected_relays();
    assert_eq!(connected.len(), 1);
    assert_eq!(connected[0].address, "relay.example:1234");
    assert_eq!(connected[0].relay_type, RelayType::Bootstrap);

    let route = service.create_route("peerB").await.expect("route created");
    let active = service.get_active_routes();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, route);
    assert_eq!(active[0].target_peer_id, "peerB");

    service.disconnect_from_relay(&connected[0].id).await;

    assert!(service.get_active_routes().is_empty());
    assert_eq!(service.get_route(&route).unwrap().state, RouteState::Closed);

    let events = log.events.lock().clone();
    let closed_at = events
        .iter()
        .position(|e| matches!(e, CircuitRelayEvent::RouteClosed { .. }))
        .expect("route closed event");
    let disconnected_at = events
        .iter()
        .position(|e| matches!(e, CircuitRelayEvent::RelayDisconnected { .. }))
        .expect("relay disconnected event");
    assert!(closed_at < disconnected_at);
    assert_eq!(
        events[0],
        CircuitRelayEvent::RelayConnected {
            relay_id: connected[0].id.clone()
        }
    );

    service.stop().await;
}

#[tokio::test]
async fn test_stop_closes_everything() {
    let (service, _) = service_with(
        CircuitRelayConfig::default().with_relays(vec![
            "seed:1".to_string(),
            "seed:2".to_string(),
        ]),
    );
    service.start().await;
    assert_eq!(service.get_connected_relays().len(), 2);
    service.create_route("peerB").await.unwrap();
    service.create_route("peerC").await.unwrap();

    service.stop().await;

    assert!(service.get_connected_relays().is_empty());
    assert!(service.get_active_routes().is_empty());
    assert!(service
        .get_all_routes()
        .iter()
        .all(|r| r.state == RouteState::Closed));
}
