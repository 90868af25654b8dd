//! Service configuration
//!
//! Durations are expressed in milliseconds when (de)serialized so a config
//! file reads `"connect_timeout_ms": 10000`.

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Configuration recognized by [`RelayService`](crate::RelayService)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitRelayConfig {
    /// Seed relay addresses, registered as bootstrap relays
    pub relays: Vec<String>,
    /// Maximum simultaneously connected relays
    pub max_relays: usize,
    /// Fill spare relay capacity automatically
    pub enable_auto_relay: bool,
    /// Connect seed relays when the service starts
    pub auto_start: bool,
    /// Base delay between signal channel reconnect attempts
    #[serde(rename = "reconnect_interval_ms", with = "duration_millis")]
    pub reconnect_interval: Duration,
    /// Reconnect attempts before the signal channel gives up
    pub max_reconnect_attempts: u32,
    /// Bound on a relay handshake or signal channel connect
    #[serde(rename = "connect_timeout_ms", with = "duration_millis")]
    pub connect_timeout: Duration,
    /// Bound on a route reservation round trip
    #[serde(rename = "reservation_timeout_ms", with = "duration_millis")]
    pub reservation_timeout: Duration,
    /// Our peer ID, announced in relay handshakes
    pub local_peer_id: String,
    /// Coordination endpoint for the signal channel (e.g. `ws://host:port/signal`)
    pub signal_endpoint: Option<String>,
    /// Reject registering a second relay with an already known address
    pub unique_relay_addresses: bool,
}

impl Default for CircuitRelayConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            max_relays: 3,
            enable_auto_relay: true,
            auto_start: true,
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            connect_timeout: Duration::from_secs(10),
            reservation_timeout: Duration::from_secs(10),
            local_peer_id: Uuid::new_v4().to_string(),
            signal_endpoint: None,
            unique_relay_addresses: false,
        }
    }
}

impl CircuitRelayConfig {
    /// Builder-style seed relay list
    pub fn with_relays(mut self, relays: Vec<String>) -> Self {
        self.relays = relays;
        self
    }

    pub fn with_max_relays(mut self, max_relays: usize) -> Self {
        self.max_relays = max_relays;
        self
    }

    pub fn with_local_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.local_peer_id = peer_id.into();
        self
    }

    pub fn with_signal_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.signal_endpoint = Some(endpoint.into());
        self
    }

    /// Check the values a running service depends on
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.max_relays == 0 {
            return Err(RelayError::InvalidConfig(
                "max_relays must be > 0".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() || self.reservation_timeout.is_zero() {
            return Err(RelayError::InvalidConfig(
                "timeouts must be > 0".to_string(),
            ));
        }
        if self.reconnect_interval.is_zero() {
            return Err(RelayError::InvalidConfig(
                "reconnect_interval must be > 0".to_string(),
            ));
        }
        if self.local_peer_id.trim().is_empty() {
            return Err(RelayError::InvalidConfig(
                "local_peer_id cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
