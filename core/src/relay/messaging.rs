//! Message relay: payload send/receive over active routes

use super::connection::RelayConnectionManager;
use super::protocol::RelayFrame;
use super::route::RouteTable;
use super::types::{RelayId, RouteId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct MessageRelay {
    connections: Arc<RelayConnectionManager>,
    routes: Arc<RouteTable>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl MessageRelay {
    pub fn new(connections: Arc<RelayConnectionManager>, routes: Arc<RouteTable>) -> Self {
        Self {
            connections,
            routes,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Send `payload` over an active route. False if the route is not active
    /// or the link refused the frame.
    pub async fn send(&self, route_id: &RouteId, payload: &[u8]) -> bool {
        let Some(route) = self.routes.get(route_id) else {
            debug!("Send on unknown route {}", route_id);
            return false;
        };
        if !route.is_active() {
            debug!("Send on inactive route {} ({:?})", route_id, route.state);
            return false;
        }
        let Some(link) = self.connections.link(&route.relay_id) else {
            return false;
        };

        let frame = RelayFrame::Data {
            route_id: route_id.clone(),
            payload: payload.to_vec(),
        };
        match link.send(frame).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Send on route {} failed: {}", route_id, e);
                false
            }
        }
    }

    /// Payloads arriving on a route, until it closes
    pub fn subscribe(&self, route_id: &RouteId) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.routes.subscribe(route_id)
    }

    /// A `Data` frame arrived from a relay
    pub fn handle_data(&self, relay_id: &RelayId, route_id: &RouteId, payload: Vec<u8>) {
        if self.routes.deliver(route_id, relay_id, payload) {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Dropped data for route {} from {}", route_id, relay_id);
        }
    }

    pub fn delivered_frames(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Inbound frames that matched no active route
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
