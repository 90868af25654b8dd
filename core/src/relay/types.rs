//! Relay and route records shared by the registry, managers and facade.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Opaque identifier assigned to a relay when it is registered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayId(String);

impl RelayId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RelayId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of a logical route. Shared by both ends of the route and the
/// relay in between, so it travels inside every route-scoped frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(String);

impl RouteId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RouteId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// How a relay entered the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelayType {
    /// Seeded from configuration at startup; cannot be removed.
    Bootstrap,
    #[default]
    Public,
    Private,
}

impl fmt::Display for RelayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayType::Bootstrap => write!(f, "bootstrap"),
            RelayType::Public => write!(f, "public"),
            RelayType::Private => write!(f, "private"),
        }
    }
}

/// A known relay peer and its connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayInfo {
    pub id: RelayId,
    /// Reachable endpoint of the relay
    pub address: String,
    pub relay_type: RelayType,
    pub is_connected: bool,
    /// Unix millis of the most recent successful connect
    pub connected_at: Option<u64>,
    /// Unix millis of the most recent traffic from the relay
    pub last_seen: Option<u64>,
    /// Last observed round-trip time
    pub latency: Option<Duration>,
}

impl RelayInfo {
    pub fn new(address: String, relay_type: RelayType) -> Self {
        Self {
            id: RelayId::generate(),
            address,
            relay_type,
            is_connected: false,
            connected_at: None,
            last_seen: None,
            latency: None,
        }
    }
}

/// Route state machine.
///
/// `Pending -> Active -> Closed`, `Pending -> Failed`, `Pending -> Closed`.
/// `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteState {
    Pending,
    Active,
    Closed,
    Failed,
}

impl RouteState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RouteState::Closed | RouteState::Failed)
    }
}

/// Who opened the route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteDirection {
    /// Opened locally with `create_route`
    Outbound,
    /// Opened by a remote peer through a relay
    Inbound,
}

/// A logical path to a peer through exactly one relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRoute {
    pub id: RouteId,
    /// The remote end of the route
    pub target_peer_id: String,
    /// The owning relay
    pub relay_id: RelayId,
    pub state: RouteState,
    pub direction: RouteDirection,
    /// Unix millis when the route entered the table
    pub created_at: u64,
    /// Unix millis of the transition to `Active`
    pub established_at: Option<u64>,
}

impl RelayRoute {
    pub fn is_active(&self) -> bool {
        self.state == RouteState::Active
    }
}

/// Current Unix time in milliseconds
pub fn current_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
