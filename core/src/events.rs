//! Lifecycle events and the bus that broadcasts them.
//!
//! Every subscriber sees every event, in registration order, delivered from
//! the code path that caused the state change. Channel subscribers get an
//! unbounded queue so a slow reader never blocks the publisher; listeners are
//! invoked inline.

use crate::relay::types::{RelayId, RouteId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Events published by the relay service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitRelayEvent {
    RelayConnected { relay_id: RelayId },
    RelayDisconnected { relay_id: RelayId },
    RouteEstablished { route_id: RouteId, target_peer_id: String },
    RouteClosed { route_id: RouteId },
    Error { message: String },
    /// The signal channel (re)connected
    SignalConnected,
    /// A signal channel reconnect attempt is scheduled
    SignalReconnecting { attempt: u32, max_attempts: u32 },
}

impl CircuitRelayEvent {
    pub fn error(message: impl Into<String>) -> Self {
        CircuitRelayEvent::Error {
            message: message.into(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            CircuitRelayEvent::RelayConnected { .. } => "RelayConnected",
            CircuitRelayEvent::RelayDisconnected { .. } => "RelayDisconnected",
            CircuitRelayEvent::RouteEstablished { .. } => "RouteEstablished",
            CircuitRelayEvent::RouteClosed { .. } => "RouteClosed",
            CircuitRelayEvent::Error { .. } => "Error",
            CircuitRelayEvent::SignalConnected => "SignalConnected",
            CircuitRelayEvent::SignalReconnecting { .. } => "SignalReconnecting",
        }
    }
}

impl fmt::Display for CircuitRelayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitRelayEvent::RelayConnected { relay_id } => {
                write!(f, "RelayConnected {{ relay_id: {} }}", relay_id)
            }
            CircuitRelayEvent::RelayDisconnected { relay_id } => {
                write!(f, "RelayDisconnected {{ relay_id: {} }}", relay_id)
            }
            CircuitRelayEvent::RouteEstablished {
                route_id,
                target_peer_id,
            } => write!(
                f,
                "RouteEstablished {{ route_id: {}, target_peer_id: {} }}",
                route_id, target_peer_id
            ),
            CircuitRelayEvent::RouteClosed { route_id } => {
                write!(f, "RouteClosed {{ route_id: {} }}", route_id)
            }
            CircuitRelayEvent::Error { message } => write!(f, "Error {{ message: {} }}", message),
            CircuitRelayEvent::SignalConnected => write!(f, "SignalConnected"),
            CircuitRelayEvent::SignalReconnecting {
                attempt,
                max_attempts,
            } => write!(
                f,
                "SignalReconnecting {{ attempt: {}/{} }}",
                attempt, max_attempts
            ),
        }
    }
}

/// Callback interface for consumers that want events inline
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &CircuitRelayEvent);
}

/// Identifies one registration on the bus
pub type SubscriptionId = u64;

/// Receiving half of a channel subscription
pub struct EventSubscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<CircuitRelayEvent>,
}

impl EventSubscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<CircuitRelayEvent> {
        self.rx.recv().await
    }

    /// Next already-delivered event, if any
    pub fn try_recv(&mut self) -> Option<CircuitRelayEvent> {
        self.rx.try_recv().ok()
    }

    /// Every event delivered so far
    pub fn drain(&mut self) -> Vec<CircuitRelayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

#[derive(Clone)]
enum Sink {
    Channel(mpsc::UnboundedSender<CircuitRelayEvent>),
    Listener(Arc<dyn EventListener>),
}

/// Typed publish/subscribe bus. Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Arc<Mutex<Vec<(SubscriptionId, Sink)>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel subscriber
    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register(Sink::Channel(tx));
        EventSubscription { id, rx }
    }

    /// Register an inline listener
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) -> SubscriptionId {
        self.register(Sink::Listener(listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.sinks.lock().retain(|(sink_id, _)| *sink_id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.lock().len()
    }

    /// Deliver an event to every current subscriber, in registration order
    pub fn publish(&self, event: CircuitRelayEvent) {
        debug!("event: {}", event);
        // Listeners may call back into the bus, so deliver outside the lock.
        let sinks: Vec<(SubscriptionId, Sink)> = self.sinks.lock().clone();

        let mut closed = Vec::new();
        for (id, sink) in &sinks {
            match sink {
                Sink::Channel(tx) => {
                    if tx.send(event.clone()).is_err() {
                        closed.push(*id);
                    }
                }
                Sink::Listener(listener) => listener.on_event(&event),
            }
        }

        if !closed.is_empty() {
            self.sinks.lock().retain(|(id, _)| !closed.contains(id));
        }
    }

    fn register(&self, sink: Sink) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sinks.lock().push((id, sink));
        id
    }
}
