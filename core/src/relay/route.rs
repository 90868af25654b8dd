//! Route table and route reservation
//!
//! [`RouteTable`] is the single owner of route state. Every state change goes
//! through it so that a watcher, a subscriber channel and the cascade on relay
//! loss all see the same transition. [`RouteManager`] drives reservations
//! against a connected relay and turns table transitions into events.

use super::connection::RelayConnectionManager;
use super::protocol::RelayFrame;
use super::types::{current_unix_millis, RelayId, RelayRoute, RouteDirection, RouteId, RouteState};
use crate::error::RelayError;
use crate::events::{CircuitRelayEvent, EventBus};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Frames held for an active route that nobody has subscribed to yet
pub const MAX_ROUTE_BACKLOG: usize = 256;

/// Closed and failed routes kept for inspection; older ones are dropped
pub const MAX_TERMINAL_ROUTES: usize = 1024;

struct RouteEntry {
    route: RelayRoute,
    state_tx: watch::Sender<RouteState>,
    failure: Option<String>,
    subscribers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    backlog: Vec<Vec<u8>>,
}

impl RouteEntry {
    fn new(route: RelayRoute) -> Self {
        let (state_tx, _) = watch::channel(route.state);
        Self {
            route,
            state_tx,
            failure: None,
            subscribers: Vec::new(),
            backlog: Vec::new(),
        }
    }

    fn set_state(&mut self, state: RouteState) {
        self.route.state = state;
        self.state_tx.send_replace(state);
        if state.is_terminal() {
            self.subscribers.clear();
            self.backlog.clear();
        }
    }
}

/// Outcome of claiming a (target, relay) pair for a new route
pub enum RouteClaim {
    /// A fresh pending route was inserted
    New(RouteId),
    /// An active route already serves the pair
    Existing(RouteId),
    /// A reservation for the pair is in flight
    Pending(RouteId, watch::Receiver<RouteState>),
}

/// Why an inbound route was not recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundRefusal {
    DuplicateId,
    RelayNotConnected,
}

/// Drop the oldest terminal entries beyond [`MAX_TERMINAL_ROUTES`]
fn prune_terminal(entries: &mut Vec<RouteEntry>) {
    let terminal = entries.iter().filter(|e| e.route.state.is_terminal()).count();
    let mut excess = terminal.saturating_sub(MAX_TERMINAL_ROUTES);
    if excess == 0 {
        return;
    }
    entries.retain(|e| {
        if excess > 0 && e.route.state.is_terminal() {
            excess -= 1;
            false
        } else {
            true
        }
    });
}

/// All routes, in creation order
#[derive(Default)]
pub struct RouteTable {
    entries: RwLock<Vec<RouteEntry>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse a live route to `target` through `relay_id`, or insert a pending one
    pub fn claim(&self, target_peer_id: &str, relay_id: &RelayId) -> RouteClaim {
        let mut entries = self.entries.write();
        let live = entries.iter().find(|e| {
            e.route.direction == RouteDirection::Outbound
                && e.route.target_peer_id == target_peer_id
                && &e.route.relay_id == relay_id
                && !e.route.state.is_terminal()
        });
        if let Some(entry) = live {
            return match entry.route.state {
                RouteState::Active => RouteClaim::Existing(entry.route.id.clone()),
                _ => RouteClaim::Pending(entry.route.id.clone(), entry.state_tx.subscribe()),
            };
        }

        let route = RelayRoute {
            id: RouteId::generate(),
            target_peer_id: target_peer_id.to_string(),
            relay_id: relay_id.clone(),
            state: RouteState::Pending,
            direction: RouteDirection::Outbound,
            created_at: current_unix_millis(),
            established_at: None,
        };
        let id = route.id.clone();
        entries.push(RouteEntry::new(route));
        RouteClaim::New(id)
    }

    /// Record a route another peer opened towards us.
    ///
    /// `relay_connected` is asked under the table lock, so a relay that is
    /// marked disconnected before its routes are cascade-closed never gains
    /// a route in between.
    pub fn insert_inbound<F>(
        &self,
        route_id: RouteId,
        source_peer_id: &str,
        relay_id: &RelayId,
        relay_connected: F,
    ) -> Result<RouteId, InboundRefusal>
    where
        F: FnOnce(&RelayId) -> bool,
    {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.route.id == route_id) {
            return Err(InboundRefusal::DuplicateId);
        }
        if !relay_connected(relay_id) {
            return Err(InboundRefusal::RelayNotConnected);
        }
        let now = current_unix_millis();
        entries.push(RouteEntry::new(RelayRoute {
            id: route_id.clone(),
            target_peer_id: source_peer_id.to_string(),
            relay_id: relay_id.clone(),
            state: RouteState::Active,
            direction: RouteDirection::Inbound,
            created_at: now,
            established_at: Some(now),
        }));
        Ok(route_id)
    }

    /// Watch a route's state
    pub fn watch(&self, id: &RouteId) -> Option<watch::Receiver<RouteState>> {
        self.entries
            .read()
            .iter()
            .find(|e| &e.route.id == id)
            .map(|e| e.state_tx.subscribe())
    }

    /// Pending -> Active, only if the acknowledging relay owns the route
    pub fn activate(&self, id: &RouteId, relay_id: &RelayId) -> Option<RelayRoute> {
        self.transition(id, |entry| {
            if entry.route.state != RouteState::Pending || &entry.route.relay_id != relay_id {
                return false;
            }
            entry.route.established_at = Some(current_unix_millis());
            entry.set_state(RouteState::Active);
            true
        })
    }

    /// Pending -> Failed
    pub fn fail(&self, id: &RouteId, reason: &str) -> Option<RelayRoute> {
        self.transition(id, |entry| {
            if entry.route.state != RouteState::Pending {
                return false;
            }
            entry.failure = Some(reason.to_string());
            entry.set_state(RouteState::Failed);
            true
        })
    }

    /// Pending|Active -> Closed. Returns the route as it was before closing.
    pub fn close(&self, id: &RouteId) -> Option<RelayRoute> {
        let mut entries = self.entries.write();
        let entry = entries
            .iter_mut()
            .find(|e| &e.route.id == id && !e.route.state.is_terminal())?;
        let before = entry.route.clone();
        entry.set_state(RouteState::Closed);
        prune_terminal(&mut entries);
        Some(before)
    }

    /// Close every live route carried by `relay_id`
    pub fn cascade_close(&self, relay_id: &RelayId) -> Vec<RouteId> {
        self.close_where(|route| &route.relay_id == relay_id)
    }

    /// Close every live route
    pub fn close_all(&self) -> Vec<RouteId> {
        self.close_where(|_| true)
    }

    fn close_where<F>(&self, matches: F) -> Vec<RouteId>
    where
        F: Fn(&RelayRoute) -> bool,
    {
        let mut entries = self.entries.write();
        let closed: Vec<RouteId> = entries
            .iter_mut()
            .filter(|e| !e.route.state.is_terminal() && matches(&e.route))
            .map(|e| {
                e.set_state(RouteState::Closed);
                e.route.id.clone()
            })
            .collect();
        prune_terminal(&mut entries);
        closed
    }

    fn transition<F>(&self, id: &RouteId, apply: F) -> Option<RelayRoute>
    where
        F: FnOnce(&mut RouteEntry) -> bool,
    {
        let mut entries = self.entries.write();
        let entry = entries.iter_mut().find(|e| &e.route.id == id)?;
        if !apply(entry) {
            return None;
        }
        let route = entry.route.clone();
        if route.state.is_terminal() {
            prune_terminal(&mut entries);
        }
        Some(route)
    }

    pub fn get(&self, id: &RouteId) -> Option<RelayRoute> {
        self.entries
            .read()
            .iter()
            .find(|e| &e.route.id == id)
            .map(|e| e.route.clone())
    }

    /// Why a failed route failed
    pub fn failure_reason(&self, id: &RouteId) -> Option<String> {
        self.entries
            .read()
            .iter()
            .find(|e| &e.route.id == id)
            .and_then(|e| e.failure.clone())
    }

    pub fn all(&self) -> Vec<RelayRoute> {
        self.entries.read().iter().map(|e| e.route.clone()).collect()
    }

    pub fn active(&self) -> Vec<RelayRoute> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.route.is_active())
            .map(|e| e.route.clone())
            .collect()
    }

    /// Receive payloads for a live route. The first subscriber gets any backlog.
    pub fn subscribe(&self, id: &RouteId) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        let mut entries = self.entries.write();
        let entry = entries
            .iter_mut()
            .find(|e| &e.route.id == id && !e.route.state.is_terminal())?;
        let (tx, rx) = mpsc::unbounded_channel();
        for payload in entry.backlog.drain(..) {
            let _ = tx.send(payload);
        }
        entry.subscribers.push(tx);
        Some(rx)
    }

    /// Hand an inbound payload to the route's subscribers.
    ///
    /// Returns false when the route is unknown, not active, owned by another
    /// relay, or its backlog is full.
    pub fn deliver(&self, id: &RouteId, relay_id: &RelayId, payload: Vec<u8>) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.iter_mut().find(|e| &e.route.id == id) else {
            return false;
        };
        if !entry.route.is_active() || &entry.route.relay_id != relay_id {
            return false;
        }

        entry.subscribers.retain(|tx| !tx.is_closed());
        match entry.subscribers.split_last() {
            None => {
                if entry.backlog.len() >= MAX_ROUTE_BACKLOG {
                    return false;
                }
                entry.backlog.push(payload);
            }
            Some((last, rest)) => {
                for tx in rest {
                    let _ = tx.send(payload.clone());
                }
                let _ = last.send(payload);
            }
        }
        true
    }
}

/// Creates and closes routes through connected relays
pub struct RouteManager {
    connections: Arc<RelayConnectionManager>,
    routes: Arc<RouteTable>,
    events: EventBus,
    reservation_timeout: Duration,
}

impl RouteManager {
    pub fn new(
        connections: Arc<RelayConnectionManager>,
        routes: Arc<RouteTable>,
        events: EventBus,
        reservation_timeout: Duration,
    ) -> Self {
        Self {
            connections,
            routes,
            events,
            reservation_timeout,
        }
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Reserve a route to `target_peer_id` through the best connected relay.
    ///
    /// An active route to the same target through the same relay is reused,
    /// and a reservation already in flight for it is joined.
    pub async fn create_route(&self, target_peer_id: &str) -> Result<RouteId, RelayError> {
        let relay = match self.connections.registry().select_for_route() {
            Some(relay) => relay,
            None => return Err(self.report(RelayError::NoConnectedRelay)),
        };
        let link = match self.connections.link(&relay.id) {
            Some(link) => link,
            None => return Err(self.report(RelayError::NoConnectedRelay)),
        };

        let (route_id, state_rx) = match self.routes.claim(target_peer_id, &relay.id) {
            RouteClaim::Existing(id) => {
                debug!("Reusing route {} to {}", id, target_peer_id);
                return Ok(id);
            }
            RouteClaim::Pending(id, rx) => {
                debug!("Joining reservation {} to {}", id, target_peer_id);
                return self.await_settled(&id, rx).await;
            }
            RouteClaim::New(id) => match self.routes.watch(&id) {
                Some(rx) => (id, rx),
                None => return Err(RelayError::RouteNotFound(id.to_string())),
            },
        };

        let _abandon = AbandonGuard {
            manager: self,
            route_id: &route_id,
        };
        info!(
            "Reserving route {} to {} via relay {}",
            route_id, target_peer_id, relay.id
        );
        let reserve = RelayFrame::Reserve {
            route_id: route_id.clone(),
            target_peer_id: target_peer_id.to_string(),
        };
        if let Err(e) = link.send(reserve).await {
            let err = RelayError::Transport(e.to_string());
            if self.routes.fail(&route_id, &err.to_string()).is_some() {
                self.report(err.clone());
            }
            return Err(err);
        }

        let settled = self.await_settled(&route_id, state_rx).await;
        settled
    }

    /// Wait for a pending route to leave `Pending`. Whoever times out first,
    /// creator or joiner, fails the route.
    async fn await_settled(
        &self,
        route_id: &RouteId,
        mut state_rx: watch::Receiver<RouteState>,
    ) -> Result<RouteId, RelayError> {
        let waited = timeout(
            self.reservation_timeout,
            state_rx.wait_for(|state| *state != RouteState::Pending),
        )
        .await;

        let state = match waited {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => return Err(RelayError::RouteNotFound(route_id.to_string())),
            Err(_) => {
                let err = RelayError::ConnectionTimeout(format!("route reservation {}", route_id));
                if self.routes.fail(route_id, &err.to_string()).is_some() {
                    self.report(err.clone());
                }
                return Err(err);
            }
        };

        match state {
            RouteState::Active => Ok(route_id.clone()),
            RouteState::Failed => {
                let relay_id = self
                    .routes
                    .get(route_id)
                    .map(|r| r.relay_id.to_string())
                    .unwrap_or_default();
                Err(RelayError::RouteReservationRejected {
                    relay_id,
                    reason: self
                        .routes
                        .failure_reason(route_id)
                        .unwrap_or_else(|| "unknown".to_string()),
                })
            }
            RouteState::Closed | RouteState::Pending => Err(RelayError::Transport(format!(
                "route {} closed before reservation completed",
                route_id
            ))),
        }
    }

    /// Close a route. Unknown or already terminal routes are ignored.
    pub async fn close_route(&self, route_id: &RouteId) {
        let Some(before) = self.routes.close(route_id) else {
            debug!("Route {} already closed or unknown", route_id);
            return;
        };
        if let Some(link) = self.connections.link(&before.relay_id) {
            let frame = RelayFrame::CloseRoute {
                route_id: route_id.clone(),
            };
            if let Err(e) = link.send(frame).await {
                debug!("Close notice for route {} not sent: {}", route_id, e);
            }
        }
        info!("Route {} closed", route_id);
        self.events.publish(CircuitRelayEvent::RouteClosed {
            route_id: route_id.clone(),
        });
    }

    /// The relay accepted a reservation
    pub async fn handle_reserve_ack(&self, relay_id: &RelayId, route_id: &RouteId) {
        if let Some(route) = self.routes.activate(route_id, relay_id) {
            info!("Route {} established to {}", route.id, route.target_peer_id);
            self.events.publish(CircuitRelayEvent::RouteEstablished {
                route_id: route.id,
                target_peer_id: route.target_peer_id,
            });
            return;
        }

        // Late ack for a route we already gave up on: tell the relay to drop it.
        if self.routes.get(route_id).is_some() {
            if let Some(link) = self.connections.link(relay_id) {
                let _ = link
                    .send(RelayFrame::CloseRoute {
                        route_id: route_id.clone(),
                    })
                    .await;
            }
        }
    }

    /// The relay refused a reservation
    pub fn handle_reserve_reject(&self, relay_id: &RelayId, route_id: &RouteId, reason: &str) {
        if self.routes.get(route_id).map(|r| r.relay_id) != Some(relay_id.clone()) {
            return;
        }
        if self.routes.fail(route_id, reason).is_some() {
            self.report(RelayError::RouteReservationRejected {
                relay_id: relay_id.to_string(),
                reason: reason.to_string(),
            });
        }
    }

    /// Another peer opened a route to us through `relay_id`. Refused unless
    /// the relay is connected.
    pub fn handle_incoming_route(&self, relay_id: &RelayId, route_id: RouteId, source_peer_id: &str) {
        let registry = self.connections.registry();
        let inserted = self
            .routes
            .insert_inbound(route_id.clone(), source_peer_id, relay_id, |id| {
                registry.get(id).is_some_and(|relay| relay.is_connected)
            });
        match inserted {
            Ok(route_id) => {
                info!("Inbound route {} from {}", route_id, source_peer_id);
                self.events.publish(CircuitRelayEvent::RouteEstablished {
                    route_id,
                    target_peer_id: source_peer_id.to_string(),
                });
            }
            Err(InboundRefusal::DuplicateId) => {
                warn!("Duplicate inbound route {} from {}", route_id, source_peer_id)
            }
            Err(InboundRefusal::RelayNotConnected) => debug!(
                "Ignoring inbound route {} from {}: relay {} not connected",
                route_id, source_peer_id, relay_id
            ),
        }
    }

    /// The far side closed a route
    pub fn handle_remote_close(&self, relay_id: &RelayId, route_id: &RouteId) {
        match self.routes.get(route_id) {
            Some(route) if &route.relay_id == relay_id => {}
            _ => return,
        }
        if self.routes.close(route_id).is_some() {
            info!("Route {} closed by remote", route_id);
            self.events.publish(CircuitRelayEvent::RouteClosed {
                route_id: route_id.clone(),
            });
        }
    }

    /// Close every remaining route, e.g. on service stop
    pub fn close_all(&self) {
        for route_id in self.routes.close_all() {
            self.events.publish(CircuitRelayEvent::RouteClosed { route_id });
        }
    }

    fn report(&self, err: RelayError) -> RelayError {
        warn!("Route operation failed: {}", err);
        self.events.publish(CircuitRelayEvent::error(err.to_string()));
        err
    }
}

/// Fails a reservation that is still pending when its creator goes away
struct AbandonGuard<'a> {
    manager: &'a RouteManager,
    route_id: &'a RouteId,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        let err = RelayError::Transport(format!("route reservation {} abandoned", self.route_id));
        if self.manager.routes.fail(self.route_id, &err.to_string()).is_some() {
            self.manager.report(err);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
