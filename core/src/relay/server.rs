//! Relay Server — accepts peer connections and forwards route traffic
//!
//! A small reference relay speaking the same frame protocol as
//! [`TcpRelayTransport`](crate::transport::TcpRelayTransport). Routing
//! decisions live in [`RelayServer::handle_frame`], which returns the frames
//! to deliver instead of writing them, so they can be tested without sockets.

use super::protocol::{read_frame, write_frame, ProtocolError, RelayFrame, PROTOCOL_VERSION};
use super::types::RouteId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Peer ID announced in handshake acks
    pub relay_peer_id: String,
    /// Maximum concurrent peer connections
    pub max_connections: usize,
    /// Maximum routes held at once
    pub max_routes: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            relay_peer_id: uuid::Uuid::new_v4().to_string(),
            max_connections: 1000,
            max_routes: 10_000,
        }
    }
}

/// Statistics about relay server operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayServerStats {
    /// Number of connected peers
    pub connections_active: usize,
    /// Number of open routes
    pub routes_active: usize,
    /// Data frames forwarded
    pub frames_forwarded: u64,
    /// Payload bytes forwarded
    pub bytes_relayed: u64,
}

/// Relay server error types
#[derive(Debug, Error)]
pub enum RelayServerError {
    #[error("Connection limit exceeded")]
    ConnectionLimitExceeded,
    #[error("Peer {0} already connected")]
    DuplicatePeer(String),
    #[error("Invalid handshake")]
    InvalidHandshake,
    #[error("Network error: {0}")]
    NetworkError(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// A frame addressed to a connected peer
pub type Outbound = (String, RelayFrame);

#[derive(Debug)]
struct RelayPeerSession {
    address: SocketAddr,
    tx: mpsc::UnboundedSender<RelayFrame>,
}

#[derive(Debug, Clone)]
struct ServerRoute {
    source: String,
    target: String,
}

impl ServerRoute {
    /// The endpoint opposite `peer_id`, if `peer_id` is an endpoint at all
    fn other_end(&self, peer_id: &str) -> Option<&str> {
        if self.source == peer_id {
            Some(&self.target)
        } else if self.target == peer_id {
            Some(&self.source)
        } else {
            None
        }
    }
}

/// The relay server
pub struct RelayServer {
    config: RelayServerConfig,
    /// Connected peers: peer_id -> session
    peers: Arc<RwLock<HashMap<String, RelayPeerSession>>>,
    routes: Arc<RwLock<HashMap<RouteId, ServerRoute>>>,
    stats: Arc<RwLock<RelayServerStats>>,
}

impl RelayServer {
    /// Create a new relay server with default configuration
    pub fn new() -> Self {
        Self::with_config(RelayServerConfig::default())
    }

    pub fn with_config(config: RelayServerConfig) -> Self {
        Self {
            config,
            peers: Arc::new(RwLock::new(HashMap::new())),
            routes: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayServerStats::default())),
        }
    }

    pub fn relay_peer_id(&self) -> &str {
        &self.config.relay_peer_id
    }

    /// Bind `addr` and serve in the background. Returns the bound address.
    pub async fn bind(
        self: Arc<Self>,
        addr: &str,
    ) -> Result<(SocketAddr, JoinHandle<()>), RelayServerError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!("Relay server listening on {}", local);
        let handle = tokio::spawn(self.serve(listener));
        Ok((local, handle))
    }

    /// Accept connections until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, address)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, address).await {
                            debug!("Connection from {} ended: {}", address, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Relay server accept failed: {}", e);
                    break;
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        address: SocketAddr,
    ) -> Result<(), RelayServerError> {
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();

        let peer_id = match read_frame(&mut reader).await {
            Ok(RelayFrame::Handshake { version, peer_id }) if version == PROTOCOL_VERSION => {
                peer_id
            }
            Ok(RelayFrame::Handshake { .. }) => {
                let refusal = RelayFrame::Disconnect {
                    reason: "Version mismatch".to_string(),
                };
                let _ = write_frame(&mut writer, &refusal).await;
                return Err(RelayServerError::InvalidHandshake);
            }
            _ => return Err(RelayServerError::InvalidHandshake),
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Err(e) = self.register_peer(peer_id.clone(), address, tx) {
            let refusal = RelayFrame::Disconnect {
                reason: e.to_string(),
            };
            let _ = write_frame(&mut writer, &refusal).await;
            return Err(e);
        }

        let ack = self.create_handshake_ack();
        if let Err(e) = write_frame(&mut writer, &ack).await {
            self.deliver(self.remove_peer(&peer_id));
            return Err(e.into());
        }
        info!("Peer {} connected from {}", peer_id, address);

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write_frame(&mut writer, &frame).await.is_err() {
                    break;
                }
            }
        });

        loop {
            match read_frame(&mut reader).await {
                Ok(RelayFrame::Disconnect { reason }) => {
                    debug!("Peer {} disconnecting: {}", peer_id, reason);
                    break;
                }
                Ok(frame) => {
                    let outbound = self.handle_frame(&peer_id, frame);
                    self.deliver(outbound);
                }
                Err(e) => {
                    debug!("Peer {} stream ended: {}", peer_id, e);
                    break;
                }
            }
        }

        self.deliver(self.remove_peer(&peer_id));
        writer_task.abort();
        info!("Peer {} disconnected", peer_id);
        Ok(())
    }

    fn deliver(&self, outbound: Vec<Outbound>) {
        let peers = self.peers.read();
        for (peer_id, frame) in outbound {
            match peers.get(&peer_id) {
                Some(session) => {
                    let _ = session.tx.send(frame);
                }
                None => debug!("Dropping {} for departed peer {}", frame.frame_type(), peer_id),
            }
        }
    }

    /// Register a new peer connection
    fn register_peer(
        &self,
        peer_id: String,
        address: SocketAddr,
        tx: mpsc::UnboundedSender<RelayFrame>,
    ) -> Result<(), RelayServerError> {
        let mut peers = self.peers.write();

        if peers.len() >= self.config.max_connections {
            return Err(RelayServerError::ConnectionLimitExceeded);
        }
        if peers.contains_key(&peer_id) {
            return Err(RelayServerError::DuplicatePeer(peer_id));
        }

        peers.insert(peer_id, RelayPeerSession { address, tx });
        self.stats.write().connections_active = peers.len();
        Ok(())
    }

    /// Drop a peer and every route it was part of. Returns close notices for
    /// the surviving endpoints.
    fn remove_peer(&self, peer_id: &str) -> Vec<Outbound> {
        {
            let mut peers = self.peers.write();
            peers.remove(peer_id);
            self.stats.write().connections_active = peers.len();
        }

        let mut routes = self.routes.write();
        let mut notices = Vec::new();
        routes.retain(|route_id, route| match route.other_end(peer_id) {
            Some(other) => {
                notices.push((
                    other.to_string(),
                    RelayFrame::CloseRoute {
                        route_id: route_id.clone(),
                    },
                ));
                false
            }
            None => true,
        });
        self.stats.write().routes_active = routes.len();
        notices
    }

    /// Apply one frame from `from_peer` and return what must be sent where
    pub fn handle_frame(&self, from_peer: &str, frame: RelayFrame) -> Vec<Outbound> {
        match frame {
            RelayFrame::Reserve {
                route_id,
                target_peer_id,
            } => self.reserve(from_peer, route_id, target_peer_id),
            RelayFrame::Data { route_id, payload } => {
                let other = match self.routes.read().get(&route_id) {
                    Some(route) => route.other_end(from_peer).map(str::to_string),
                    None => None,
                };
                match other {
                    Some(other) => {
                        self.add_bytes_relayed(payload.len() as u64);
                        vec![(other, RelayFrame::Data { route_id, payload })]
                    }
                    None => {
                        debug!("Data on unknown route {} from {}", route_id, from_peer);
                        Vec::new()
                    }
                }
            }
            RelayFrame::CloseRoute { route_id } => {
                let mut routes = self.routes.write();
                let other = routes
                    .get(&route_id)
                    .and_then(|route| route.other_end(from_peer))
                    .map(str::to_string);
                match other {
                    Some(other) => {
                        routes.remove(&route_id);
                        self.stats.write().routes_active = routes.len();
                        vec![(other, RelayFrame::CloseRoute { route_id })]
                    }
                    None => Vec::new(),
                }
            }
            RelayFrame::Ping { nonce } => {
                vec![(from_peer.to_string(), RelayFrame::Pong { nonce })]
            }
            other => {
                debug!("Ignoring {} from {}", other.frame_type(), from_peer);
                Vec::new()
            }
        }
    }

    fn reserve(&self, from_peer: &str, route_id: RouteId, target_peer_id: String) -> Vec<Outbound> {
        let reject = |reason: &str| {
            vec![(
                from_peer.to_string(),
                RelayFrame::ReserveReject {
                    route_id: route_id.clone(),
                    reason: reason.to_string(),
                },
            )]
        };

        if target_peer_id == from_peer {
            return reject("cannot route to self");
        }
        if !self.is_peer_connected(&target_peer_id) {
            return reject("target peer not connected");
        }

        let mut routes = self.routes.write();
        if routes.len() >= self.config.max_routes {
            return reject("route capacity exceeded");
        }
        if routes.contains_key(&route_id) {
            return reject("duplicate route id");
        }
        routes.insert(
            route_id.clone(),
            ServerRoute {
                source: from_peer.to_string(),
                target: target_peer_id.clone(),
            },
        );
        self.stats.write().routes_active = routes.len();
        debug!("Route {} reserved: {} -> {}", route_id, from_peer, target_peer_id);

        vec![
            (
                target_peer_id,
                RelayFrame::IncomingRoute {
                    route_id: route_id.clone(),
                    source_peer_id: from_peer.to_string(),
                },
            ),
            (from_peer.to_string(), RelayFrame::ReserveAck { route_id }),
        ]
    }

    pub fn get_stats(&self) -> RelayServerStats {
        self.stats.read().clone()
    }

    pub fn is_peer_connected(&self, peer_id: &str) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    /// Remote address of a connected peer
    pub fn peer_address(&self, peer_id: &str) -> Option<SocketAddr> {
        self.peers.read().get(peer_id).map(|session| session.address)
    }

    pub fn create_handshake_ack(&self) -> RelayFrame {
        RelayFrame::HandshakeAck {
            version: PROTOCOL_VERSION,
            relay_peer_id: self.config.relay_peer_id.clone(),
        }
    }

    fn add_bytes_relayed(&self, bytes: u64) {
        let mut stats = self.stats.write();
        stats.frames_forwarded += 1;
        stats.bytes_relayed += bytes;
    }
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
