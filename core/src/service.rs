//! Relay service — the public facade
//!
//! Owns the registry, route table and the three managers, plus two background
//! tasks while running: the inbound frame dispatcher and the signal message
//! handler. Facade methods report failure as `bool`/`Option` and publish the
//! detail as an `Error` event.

use crate::config::CircuitRelayConfig;
use crate::error::RelayError;
use crate::events::{CircuitRelayEvent, EventBus, EventListener, EventSubscription, SubscriptionId};
use crate::relay::connection::{ConnectionSettings, RelayConnectionManager};
use crate::relay::messaging::MessageRelay;
use crate::relay::protocol::{RelayFrame, SignalMessage};
use crate::relay::registry::RelayRegistry;
use crate::relay::route::{RouteManager, RouteTable};
use crate::relay::types::{current_unix_millis, RelayId, RelayInfo, RelayRoute, RelayType, RouteId};
use crate::signal::{SignalChannel, SignalConnector, SignalSettings, WebSocketConnector};
use crate::transport::{InboundFrame, LinkEvent, RelayTransport};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Point-in-time summary of the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub signal_connected: bool,
    pub relays_known: usize,
    pub relays_connected: usize,
    pub max_relays: usize,
    pub routes_active: usize,
    pub dropped_frames: u64,
}

/// Components the background tasks work on
#[derive(Clone)]
struct Components {
    config: CircuitRelayConfig,
    events: EventBus,
    registry: Arc<RelayRegistry>,
    connections: Arc<RelayConnectionManager>,
    routes: Arc<RouteManager>,
    messages: Arc<MessageRelay>,
}

type Slot<T> = Arc<Mutex<Option<mpsc::UnboundedReceiver<T>>>>;

struct BackgroundTask {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct RelayService {
    parts: Components,
    signal: Option<Arc<SignalChannel>>,
    running: Arc<RwLock<bool>>,
    /// Serializes start/stop
    lifecycle: tokio::sync::Mutex<()>,
    inbound: Slot<InboundFrame>,
    signal_inbound: Slot<SignalMessage>,
    tasks: Mutex<Vec<BackgroundTask>>,
}

impl RelayService {
    /// Build a service. A configured `signal_endpoint` is dialed over WebSocket.
    pub fn new(
        config: CircuitRelayConfig,
        transport: Arc<dyn RelayTransport>,
    ) -> Result<Self, RelayError> {
        let connector = config
            .signal_endpoint
            .clone()
            .map(|url| Arc::new(WebSocketConnector::new(url)) as Arc<dyn SignalConnector>);
        Self::build(config, transport, connector)
    }

    /// Build a service with a custom signal connector
    pub fn with_signal_connector(
        config: CircuitRelayConfig,
        transport: Arc<dyn RelayTransport>,
        connector: Arc<dyn SignalConnector>,
    ) -> Result<Self, RelayError> {
        Self::build(config, transport, Some(connector))
    }

    fn build(
        config: CircuitRelayConfig,
        transport: Arc<dyn RelayTransport>,
        connector: Option<Arc<dyn SignalConnector>>,
    ) -> Result<Self, RelayError> {
        config.validate()?;

        let events = EventBus::new();
        let registry = Arc::new(if config.unique_relay_addresses {
            RelayRegistry::with_unique_addresses()
        } else {
            RelayRegistry::new()
        });
        for address in &config.relays {
            if let Err(e) = registry.add(address, RelayType::Bootstrap) {
                warn!("Skipping seed relay {}: {}", address, e);
            }
        }

        let table = Arc::new(RouteTable::new());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connections = Arc::new(RelayConnectionManager::new(
            ConnectionSettings {
                max_relays: config.max_relays,
                connect_timeout: config.connect_timeout,
                enable_auto_relay: config.enable_auto_relay,
                local_peer_id: config.local_peer_id.clone(),
            },
            Arc::clone(&registry),
            Arc::clone(&table),
            transport,
            events.clone(),
            inbound_tx,
        ));
        let routes = Arc::new(RouteManager::new(
            Arc::clone(&connections),
            Arc::clone(&table),
            events.clone(),
            config.reservation_timeout,
        ));
        let messages = Arc::new(MessageRelay::new(Arc::clone(&connections), table));

        let signal = connector.map(|connector| {
            Arc::new(SignalChannel::new(
                connector,
                SignalSettings {
                    connect_timeout: config.connect_timeout,
                    reconnect_interval: config.reconnect_interval,
                    max_reconnect_attempts: config.max_reconnect_attempts,
                },
                events.clone(),
            ))
        });
        let signal_inbound = signal.as_ref().and_then(|s| s.take_inbound());
        if let Some(signal) = &signal {
            events.add_listener(Arc::new(SignalNotifier {
                signal: Arc::downgrade(signal),
            }));
        }

        Ok(Self {
            parts: Components {
                config,
                events,
                registry,
                connections,
                routes,
                messages,
            },
            signal,
            running: Arc::new(RwLock::new(false)),
            lifecycle: tokio::sync::Mutex::new(()),
            inbound: Arc::new(Mutex::new(Some(inbound_rx))),
            signal_inbound: Arc::new(Mutex::new(signal_inbound)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    // ------------------------------------------------------------------------
    // LIFECYCLE
    // ------------------------------------------------------------------------

    /// Start dispatching, connect the signal channel and bring up relays.
    ///
    /// On a running service this only restarts a signal channel that has
    /// given up reconnecting.
    pub async fn start(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if *self.running.read() {
            if let Some(signal) = &self.signal {
                if let Err(e) = signal.connect().await {
                    warn!("Signal channel not yet available: {}", e);
                }
            }
            return;
        }
        info!("Relay service starting...");
        self.parts.connections.reopen();
        *self.running.write() = true;

        self.spawn_dispatcher();
        self.spawn_signal_handler();

        if let Some(signal) = &self.signal {
            if let Err(e) = signal.connect().await {
                warn!("Signal channel not yet available: {}", e);
            }
        }

        if self.parts.config.auto_start {
            for seed in self.parts.registry.all() {
                if seed.relay_type == RelayType::Bootstrap && !seed.is_connected {
                    if self.parts.registry.connected_count() >= self.parts.config.max_relays {
                        break;
                    }
                    let _ = self.parts.connections.connect(&seed.id).await;
                }
            }
        }
        if self.parts.config.enable_auto_relay {
            self.parts.connections.fill_capacity().await;
        }

        info!(
            "Relay service started ({} relays connected)",
            self.parts.registry.connected_count()
        );
    }

    /// Disconnect everything and stop background work
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if !*self.running.read() {
            return;
        }
        info!("Relay service stopping...");
        *self.running.write() = false;

        self.parts.connections.shutdown().await;
        self.parts.routes.close_all();
        if let Some(signal) = &self.signal {
            signal.disconnect().await;
        }

        let tasks: Vec<BackgroundTask> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.stop.send(());
            let _ = task.handle.await;
        }
        info!("Relay service stopped");
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    fn spawn_dispatcher(&self) {
        let Some(mut rx) = self.inbound.lock().take() else {
            return;
        };
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let parts = self.parts.clone();
        let slot = Arc::clone(&self.inbound);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    frame = rx.recv() => match frame {
                        Some(frame) => parts.dispatch(frame).await,
                        None => break,
                    },
                }
            }
            *slot.lock() = Some(rx);
        });
        self.tasks.lock().push(BackgroundTask {
            stop: stop_tx,
            handle,
        });
    }

    fn spawn_signal_handler(&self) {
        let Some(mut rx) = self.signal_inbound.lock().take() else {
            return;
        };
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let parts = self.parts.clone();
        let slot = Arc::clone(&self.signal_inbound);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    message = rx.recv() => match message {
                        Some(message) => parts.handle_signal_message(message).await,
                        None => break,
                    },
                }
            }
            *slot.lock() = Some(rx);
        });
        self.tasks.lock().push(BackgroundTask {
            stop: stop_tx,
            handle,
        });
    }

    // ------------------------------------------------------------------------
    // RELAYS
    // ------------------------------------------------------------------------

    /// Register a relay. `None` only when unique addresses are enforced and
    /// the address is already known.
    pub fn add_relay(&self, address: &str, relay_type: RelayType) -> Option<RelayId> {
        self.parts.add_relay(address, relay_type)
    }

    /// Remove a relay, disconnecting it first. Bootstrap and unknown relays
    /// are left alone.
    pub async fn remove_relay(&self, id: &RelayId) {
        self.parts.remove_relay(id).await;
    }

    pub async fn connect_to_relay(&self, id: &RelayId) -> bool {
        self.parts.connections.connect(id).await.is_ok()
    }

    pub async fn disconnect_from_relay(&self, id: &RelayId) {
        self.parts.connections.disconnect(id).await;
    }

    /// Round-trip time to a connected relay
    pub async fn measure_relay_latency(&self, id: &RelayId) -> Option<Duration> {
        match self.parts.connections.probe_latency(id).await {
            Ok(rtt) => Some(rtt),
            Err(e) => {
                warn!("Latency probe to {} failed: {}", id, e);
                self.parts.events.publish(CircuitRelayEvent::error(e.to_string()));
                None
            }
        }
    }

    pub fn get_all_relays(&self) -> Vec<RelayInfo> {
        self.parts.registry.all()
    }

    pub fn get_connected_relays(&self) -> Vec<RelayInfo> {
        self.parts.registry.connected()
    }

    // ------------------------------------------------------------------------
    // ROUTES & MESSAGES
    // ------------------------------------------------------------------------

    pub async fn create_route(&self, target_peer_id: &str) -> Option<RouteId> {
        self.parts.routes.create_route(target_peer_id).await.ok()
    }

    pub async fn close_route(&self, route_id: &RouteId) {
        self.parts.routes.close_route(route_id).await;
    }

    pub async fn send_message_through_route(&self, route_id: &RouteId, payload: &[u8]) -> bool {
        self.parts.messages.send(route_id, payload).await
    }

    /// Payloads arriving on a route, until it closes
    pub fn subscribe_route(&self, route_id: &RouteId) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.parts.messages.subscribe(route_id)
    }

    pub fn get_route(&self, route_id: &RouteId) -> Option<RelayRoute> {
        self.parts.routes.routes().get(route_id)
    }

    pub fn get_all_routes(&self) -> Vec<RelayRoute> {
        self.parts.routes.routes().all()
    }

    pub fn get_active_routes(&self) -> Vec<RelayRoute> {
        self.parts.routes.routes().active()
    }

    // ------------------------------------------------------------------------
    // EVENTS & SIGNALING
    // ------------------------------------------------------------------------

    pub fn subscribe(&self) -> EventSubscription {
        self.parts.events.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) -> SubscriptionId {
        self.parts.events.add_listener(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.parts.events.unsubscribe(id);
    }

    /// Subscribe to a signal topic. False when no signal channel is configured.
    pub fn signal_subscribe(&self, topic: &str) -> bool {
        match &self.signal {
            Some(signal) => signal.subscribe(topic).is_ok(),
            None => false,
        }
    }

    pub fn signal_unsubscribe(&self, topic: &str) -> bool {
        match &self.signal {
            Some(signal) => signal.unsubscribe(topic).is_ok(),
            None => false,
        }
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            running: self.is_running(),
            signal_connected: self.signal.as_ref().is_some_and(|s| s.is_connected()),
            relays_known: self.parts.registry.len(),
            relays_connected: self.parts.registry.connected_count(),
            max_relays: self.parts.config.max_relays,
            routes_active: self.parts.routes.routes().active().len(),
            dropped_frames: self.parts.messages.dropped_frames(),
        }
    }

    pub fn config(&self) -> &CircuitRelayConfig {
        &self.parts.config
    }
}

impl Drop for RelayService {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.handle.abort();
        }
    }
}

impl Components {
    fn add_relay(&self, address: &str, relay_type: RelayType) -> Option<RelayId> {
        match self.registry.add(address, relay_type) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Relay {} not added: {}", address, e);
                self.events.publish(CircuitRelayEvent::error(e.to_string()));
                None
            }
        }
    }

    async fn remove_relay(&self, id: &RelayId) {
        match self.registry.get(id) {
            Some(relay) if relay.relay_type != RelayType::Bootstrap => {}
            Some(_) => {
                debug!("Refusing to remove bootstrap relay {}", id);
                return;
            }
            None => return,
        }
        self.connections.disconnect(id).await;
        if self.registry.remove(id).is_some() {
            info!("Removed relay {}", id);
        }
    }

    async fn dispatch(&self, inbound: InboundFrame) {
        // Anything queued by a link that has since been replaced or
        // disconnected no longer speaks for the relay.
        if !self.connections.is_current_link(&inbound.relay_id, inbound.link_id) {
            debug!("Dropping {} (link {} no longer current)", inbound, inbound.link_id);
            return;
        }
        let InboundFrame {
            relay_id,
            link_id,
            event,
        } = inbound;
        let frame = match event {
            LinkEvent::Closed => {
                self.connections.handle_link_lost(&relay_id, link_id);
                return;
            }
            LinkEvent::Frame(frame) => frame,
        };
        self.registry.touch(&relay_id, current_unix_millis());

        match frame {
            RelayFrame::ReserveAck { route_id } => {
                self.routes.handle_reserve_ack(&relay_id, &route_id).await;
            }
            RelayFrame::ReserveReject { route_id, reason } => {
                self.routes.handle_reserve_reject(&relay_id, &route_id, &reason);
            }
            RelayFrame::IncomingRoute {
                route_id,
                source_peer_id,
            } => {
                self.routes
                    .handle_incoming_route(&relay_id, route_id, &source_peer_id);
            }
            RelayFrame::Data { route_id, payload } => {
                self.messages.handle_data(&relay_id, &route_id, payload);
            }
            RelayFrame::CloseRoute { route_id } => {
                self.routes.handle_remote_close(&relay_id, &route_id);
            }
            RelayFrame::Ping { nonce } => {
                if let Some(link) = self.connections.link(&relay_id) {
                    let _ = link.send(RelayFrame::Pong { nonce }).await;
                }
            }
            RelayFrame::Pong { nonce } => self.connections.handle_pong(&relay_id, nonce),
            RelayFrame::Disconnect { reason } => {
                info!("Relay {} disconnecting: {}", relay_id, reason);
                self.connections.handle_link_lost(&relay_id, link_id);
            }
            other => debug!("Unexpected {} from relay {}", other.frame_type(), relay_id),
        }
    }

    async fn handle_signal_message(&self, message: SignalMessage) {
        match message.message_type.as_str() {
            "relay_announce" => {
                let Some(address) = message.data_str("address") else {
                    debug!("relay_announce without address");
                    return;
                };
                if self.registry.find_by_address(address).is_some() {
                    return;
                }
                let relay_type = match message.data_str("relay_type") {
                    Some("private") => RelayType::Private,
                    _ => RelayType::Public,
                };
                if self.add_relay(address, relay_type).is_some() && self.config.enable_auto_relay {
                    self.connections.fill_capacity().await;
                }
            }
            "relay_withdraw" => {
                let Some(address) = message.data_str("address") else {
                    return;
                };
                if let Some(relay) = self.registry.find_by_address(address) {
                    self.remove_relay(&relay.id).await;
                }
            }
            other => debug!("Unhandled signal message {}", other),
        }
    }
}

/// Mirrors relay and route changes onto the signal channel
struct SignalNotifier {
    signal: Weak<SignalChannel>,
}

impl EventListener for SignalNotifier {
    fn on_event(&self, event: &CircuitRelayEvent) {
        let Some(signal) = self.signal.upgrade() else {
            return;
        };
        if !signal.is_connected() {
            return;
        }
        let (message_type, data) = match event {
            CircuitRelayEvent::RelayConnected { relay_id } => {
                ("relay_connected", serde_json::json!({ "relay_id": relay_id }))
            }
            CircuitRelayEvent::RelayDisconnected { relay_id } => {
                ("relay_disconnected", serde_json::json!({ "relay_id": relay_id }))
            }
            CircuitRelayEvent::RouteEstablished {
                route_id,
                target_peer_id,
            } => (
                "route_established",
                serde_json::json!({ "route_id": route_id, "target_peer_id": target_peer_id }),
            ),
            CircuitRelayEvent::RouteClosed { route_id } => {
                ("route_closed", serde_json::json!({ "route_id": route_id }))
            }
            _ => return,
        };
        if let Err(e) = signal.send(message_type, Some(data)) {
            debug!("Control notification {} not sent: {}", message_type, e);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemorySignalConnector, MemoryTransport};

    fn service(config: CircuitRelayConfig) -> RelayService {
        RelayService::new(config, Arc::new(MemoryTransport::new())).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CircuitRelayConfig::default().with_max_relays(0);
        assert!(RelayService::new(config, Arc::new(MemoryTransport::new())).is_err());
    }

    #[test]
    fn test_seed_relays_registered_as_bootstrap() {
        let svc = service(
            CircuitRelayConfig::default()
                .with_relays(vec!["seed:1".to_string(), "seed:2".to_string()]),
        );
        let relays = svc.get_all_relays();
        assert_eq!(relays.len(), 2);
        assert!(relays.iter().all(|r| r.relay_type == RelayType::Bootstrap));
        assert!(!svc.is_running());
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let svc = service(CircuitRelayConfig::default().with_relays(vec!["seed:1".to_string()]));

        svc.start().await;
        svc.start().await;
        assert!(svc.is_running());
        assert_eq!(svc.get_connected_relays().len(), 1);

        svc.stop().await;
        svc.stop().await;
        assert!(!svc.is_running());
        assert!(svc.get_connected_relays().is_empty());

        // Restart reuses the dispatcher channel.
        svc.start().await;
        assert_eq!(svc.get_connected_relays().len(), 1);
        assert!(svc.create_route("peerB").await.is_some());
        svc.stop().await;
    }

    #[tokio::test]
    async fn test_status_reflects_state() {
        let svc = service(
            CircuitRelayConfig::default()
                .with_relays(vec!["seed:1".to_string()])
                .with_max_relays(2),
        );
        svc.start().await;
        svc.create_route("peerB").await.unwrap();

        let status = svc.status();
        assert!(status.running);
        assert!(!status.signal_connected);
        assert_eq!(status.relays_known, 1);
        assert_eq!(status.relays_connected, 1);
        assert_eq!(status.max_relays, 2);
        assert_eq!(status.routes_active, 1);
        svc.stop().await;
    }

    #[tokio::test]
    async fn test_signal_subscribe_without_channel() {
        let svc = service(CircuitRelayConfig::default());
        assert!(!svc.signal_subscribe("relays"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_announce_adds_relay() {
        let connector = Arc::new(MemorySignalConnector::new());
        let svc = RelayService::with_signal_connector(
            CircuitRelayConfig::default(),
            Arc::new(MemoryTransport::new()),
            connector.clone(),
        )
        .unwrap();
        svc.start().await;
        assert!(svc.status().signal_connected);

        connector.push_to_client(
            r#"{"type":"relay_announce","data":{"address":"relay:announced"},"timestamp":1}"#,
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        let relays = svc.get_all_relays();
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].address, "relay:announced");
        assert!(relays[0].is_connected);

        connector.push_to_client(
            r#"{"type":"relay_withdraw","data":{"address":"relay:announced"},"timestamp":2}"#,
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(svc.get_all_relays().is_empty());

        let sent: Vec<String> = connector
            .sent_messages()
            .into_iter()
            .map(|m| m.message_type)
            .collect();
        assert!(sent.contains(&"relay_connected".to_string()));
        assert!(sent.contains(&"relay_disconnected".to_string()));
        svc.stop().await;
    }
}
