//! Relay Connection Manager — brings relays up and down under a capacity cap

use super::protocol::RelayFrame;
use super::registry::RelayRegistry;
use super::route::RouteTable;
use super::types::{current_unix_millis, RelayId, RelayInfo};
use crate::error::RelayError;
use crate::events::{CircuitRelayEvent, EventBus};
use crate::transport::{InboundFrame, InboundSender, LinkId, RelayLink, RelayTransport};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

type ConnectWaiter = oneshot::Sender<Result<(), RelayError>>;
type ConnectingMap = Mutex<HashMap<RelayId, Vec<ConnectWaiter>>>;

struct ActiveLink {
    id: LinkId,
    link: Arc<dyn RelayLink>,
}

/// An in-flight connect. Dropping it, finished or not, clears the
/// `connecting` entry and answers every caller that joined it.
struct ConnectAttempt<'a> {
    connecting: &'a ConnectingMap,
    relay_id: RelayId,
    outcome: Option<Result<(), RelayError>>,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| {
            Err(RelayError::Transport(format!(
                "connect to relay {} cancelled",
                self.relay_id
            )))
        });
        let waiters = self
            .connecting
            .lock()
            .remove(&self.relay_id)
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Connection settings taken from the service configuration
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub max_relays: usize,
    pub connect_timeout: Duration,
    pub enable_auto_relay: bool,
    pub local_peer_id: String,
}

/// Opens and closes transport links to registered relays
pub struct RelayConnectionManager {
    settings: ConnectionSettings,
    registry: Arc<RelayRegistry>,
    routes: Arc<RouteTable>,
    transport: Arc<dyn RelayTransport>,
    events: EventBus,
    inbound: mpsc::UnboundedSender<InboundFrame>,
    /// Open links by relay
    links: RwLock<HashMap<RelayId, ActiveLink>>,
    /// Connects in flight; later callers for the same relay wait here
    connecting: ConnectingMap,
    /// Outstanding latency probes by nonce
    pending_pings: Mutex<HashMap<u64, (RelayId, oneshot::Sender<()>)>>,
    next_nonce: AtomicU64,
    next_link_id: AtomicU64,
    shut_down: AtomicBool,
}

impl RelayConnectionManager {
    pub fn new(
        settings: ConnectionSettings,
        registry: Arc<RelayRegistry>,
        routes: Arc<RouteTable>,
        transport: Arc<dyn RelayTransport>,
        events: EventBus,
        inbound: mpsc::UnboundedSender<InboundFrame>,
    ) -> Self {
        Self {
            settings,
            registry,
            routes,
            transport,
            events,
            inbound,
            links: RwLock::new(HashMap::new()),
            connecting: Mutex::new(HashMap::new()),
            pending_pings: Mutex::new(HashMap::new()),
            next_nonce: AtomicU64::new(1),
            next_link_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<RelayRegistry> {
        &self.registry
    }

    pub fn max_relays(&self) -> usize {
        self.settings.max_relays
    }

    /// The open link to a relay, if connected
    pub fn link(&self, id: &RelayId) -> Option<Arc<dyn RelayLink>> {
        self.links.read().get(id).map(|active| Arc::clone(&active.link))
    }

    /// Whether `link_id` is the link currently serving `relay_id`
    pub fn is_current_link(&self, relay_id: &RelayId, link_id: LinkId) -> bool {
        self.links
            .read()
            .get(relay_id)
            .is_some_and(|active| active.id == link_id)
    }

    /// Connected relays
    pub fn connected(&self) -> Vec<RelayInfo> {
        self.registry.connected()
    }

    /// Connect to a registered relay.
    ///
    /// Already-connected relays succeed immediately; a second caller for a
    /// relay that is mid-handshake shares the first caller's outcome.
    pub async fn connect(&self, id: &RelayId) -> Result<(), RelayError> {
        let relay = match self.registry.get(id) {
            Some(relay) => relay,
            None => return Err(self.report(RelayError::RelayNotFound(id.to_string()))),
        };
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(RelayError::Transport("relay service stopped".to_string()));
        }
        if relay.is_connected && self.links.read().contains_key(id) {
            debug!("Relay {} already connected", id);
            return Ok(());
        }

        let joined = {
            let mut connecting = self.connecting.lock();
            if let Some(waiters) = connecting.get_mut(id) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            } else {
                // In-flight connects count against capacity.
                if self.registry.connected_count() + connecting.len() >= self.settings.max_relays {
                    drop(connecting);
                    return Err(self.report(RelayError::RelayCapacityExceeded {
                        max: self.settings.max_relays,
                    }));
                }
                connecting.insert(id.clone(), Vec::new());
                None
            }
        };
        if let Some(rx) = joined {
            return match timeout(self.settings.connect_timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(RelayError::Transport("connect attempt abandoned".to_string())),
                Err(_) => Err(RelayError::ConnectionTimeout(format!(
                    "waiting for relay {} at {}",
                    id, relay.address
                ))),
            };
        }

        let mut attempt = ConnectAttempt {
            connecting: &self.connecting,
            relay_id: id.clone(),
            outcome: None,
        };
        let result = self.open_link(&relay).await;
        attempt.outcome = Some(result.clone());
        drop(attempt);
        result
    }

    async fn open_link(&self, relay: &RelayInfo) -> Result<(), RelayError> {
        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        info!(
            "Connecting to relay {} at {} (link {})",
            relay.id, relay.address, link_id
        );
        let inbound = InboundSender::new(relay.id.clone(), link_id, self.inbound.clone());
        let attempt = self.transport.connect(
            relay.address.clone(),
            self.settings.local_peer_id.clone(),
            inbound.clone(),
        );

        let link = match timeout(self.settings.connect_timeout, attempt).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                return Err(self.report(RelayError::ConnectionRefused {
                    address: relay.address.clone(),
                    reason: e.to_string(),
                }))
            }
            Err(_) => {
                return Err(self.report(RelayError::ConnectionTimeout(format!(
                    "relay {} at {}",
                    relay.id, relay.address
                ))))
            }
        };

        // The relay may have been removed or the service stopped meanwhile.
        if self.shut_down.load(Ordering::SeqCst) || !self.registry.contains(&relay.id) {
            link.close().await;
            return Err(RelayError::Transport(format!(
                "relay {} no longer wanted",
                relay.id
            )));
        }

        self.links
            .write()
            .insert(relay.id.clone(), ActiveLink { id: link_id, link });
        self.registry.mark_connected(&relay.id, current_unix_millis());
        // Frames the relay sent during the handshake go out only now.
        inbound.open();
        info!("Connected to relay {} at {}", relay.id, relay.address);
        self.events.publish(CircuitRelayEvent::RelayConnected {
            relay_id: relay.id.clone(),
        });
        Ok(())
    }

    /// Disconnect a relay, closing every route it owns first
    pub async fn disconnect(&self, id: &RelayId) {
        let active = self.links.write().remove(id);
        if let Some(active) = active {
            active.link.close().await;
        }
        self.finish_disconnect(id);
    }

    /// Link `link_id` to relay `id` went away on its own. Ignored unless it
    /// is still the relay's current link.
    pub fn handle_link_lost(&self, id: &RelayId, link_id: LinkId) {
        let removed = {
            let mut links = self.links.write();
            match links.get(id) {
                Some(active) if active.id == link_id => links.remove(id).is_some(),
                _ => false,
            }
        };
        if !removed {
            debug!("Ignoring loss of stale link {} to relay {}", link_id, id);
            return;
        }
        warn!("Link to relay {} lost", id);
        self.finish_disconnect(id);
    }

    fn finish_disconnect(&self, id: &RelayId) {
        let was_connected = self.registry.mark_disconnected(id);

        for route_id in self.routes.cascade_close(id) {
            self.events.publish(CircuitRelayEvent::RouteClosed { route_id });
        }
        self.pending_pings.lock().retain(|_, (relay_id, _)| relay_id != id);

        if was_connected {
            info!("Disconnected from relay {}", id);
            self.events.publish(CircuitRelayEvent::RelayDisconnected {
                relay_id: id.clone(),
            });
        }
    }

    /// Pick an unconnected relay to fill spare capacity, if auto-relay is on
    pub fn auto_select(&self) -> Option<RelayId> {
        self.auto_select_excluding(&[])
    }

    fn auto_select_excluding(&self, tried: &[RelayId]) -> Option<RelayId> {
        if !self.settings.enable_auto_relay {
            return None;
        }
        let mut exclude: Vec<RelayId> = self.connecting.lock().keys().cloned().collect();
        if self.registry.connected_count() + exclude.len() >= self.settings.max_relays {
            return None;
        }
        exclude.extend_from_slice(tried);
        self.registry.select_unconnected(&exclude).map(|relay| relay.id)
    }

    /// Connect auto-selected relays until capacity is reached or no
    /// candidate remains. Returns how many connected.
    pub async fn fill_capacity(&self) -> usize {
        let mut tried = Vec::new();
        let mut connected = 0;
        while let Some(id) = self.auto_select_excluding(&tried) {
            tried.push(id.clone());
            if self.connect(&id).await.is_ok() {
                connected += 1;
            }
        }
        connected
    }

    /// Measure round-trip time to a connected relay and record it
    pub async fn probe_latency(&self, id: &RelayId) -> Result<Duration, RelayError> {
        let link = self
            .link(id)
            .ok_or_else(|| RelayError::RelayNotFound(id.to_string()))?;

        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_pings.lock().insert(nonce, (id.clone(), tx));

        let started = Instant::now();
        if let Err(e) = link.send(RelayFrame::Ping { nonce }).await {
            self.pending_pings.lock().remove(&nonce);
            return Err(RelayError::Transport(e.to_string()));
        }

        match timeout(self.settings.connect_timeout, rx).await {
            Ok(Ok(())) => {
                let rtt = started.elapsed();
                self.registry.record_latency(id, rtt);
                debug!("Relay {} latency {:?}", id, rtt);
                Ok(rtt)
            }
            Ok(Err(_)) => Err(RelayError::Transport(format!("link to {} closed", id))),
            Err(_) => {
                self.pending_pings.lock().remove(&nonce);
                Err(RelayError::ConnectionTimeout(format!("latency probe to {}", id)))
            }
        }
    }

    /// A `Pong` arrived from a relay
    pub fn handle_pong(&self, relay_id: &RelayId, nonce: u64) {
        let mut pending = self.pending_pings.lock();
        match pending.get(&nonce) {
            Some((expected, _)) if expected == relay_id => {
                if let Some((_, tx)) = pending.remove(&nonce) {
                    let _ = tx.send(());
                }
            }
            _ => debug!("Unsolicited pong {} from {}", nonce, relay_id),
        }
    }

    /// Disconnect every relay and refuse new connects until `reopen`
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let mut ids: Vec<RelayId> = self.links.read().keys().cloned().collect();
        for relay in self.registry.connected() {
            if !ids.contains(&relay.id) {
                ids.push(relay.id);
            }
        }
        for id in ids {
            self.disconnect(&id).await;
        }
    }

    pub fn reopen(&self) {
        self.shut_down.store(false, Ordering::SeqCst);
    }

    fn report(&self, err: RelayError) -> RelayError {
        warn!("Relay connection failed: {}", err);
        self.events.publish(CircuitRelayEvent::error(err.to_string()));
        err
    }
}

// ============================================================================
// TESTS
// ============================================================================
