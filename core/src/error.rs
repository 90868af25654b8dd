//! Error taxonomy for the circuit-relay subsystem.

use thiserror::Error;

/// Errors produced by relay, route and signal-channel operations.
///
/// The [`RelayService`](crate::RelayService) facade never returns these
/// directly; it reports failures as `bool`/`Option` results and publishes the
/// detail as an [`CircuitRelayEvent::Error`](crate::CircuitRelayEvent::Error).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("Relay not found: {0}")]
    RelayNotFound(String),
    #[error("Relay capacity exceeded ({max} relays connected)")]
    RelayCapacityExceeded { max: usize },
    #[error("Connection timed out: {0}")]
    ConnectionTimeout(String),
    #[error("Connection refused by {address}: {reason}")]
    ConnectionRefused { address: String, reason: String },
    #[error("No connected relay available")]
    NoConnectedRelay,
    #[error("Route reservation rejected by relay {relay_id}: {reason}")]
    RouteReservationRejected { relay_id: String, reason: String },
    #[error("Route not found: {0}")]
    RouteNotFound(String),
    #[error("Signal channel unavailable: {0}")]
    SignalChannelUnavailable(String),
    #[error("Relay already registered at {0}")]
    DuplicateRelay(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RelayError {
    /// Whether the failure is local to one attempt and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::ConnectionTimeout(_)
                | RelayError::ConnectionRefused { .. }
                | RelayError::Transport(_)
                | RelayError::SignalChannelUnavailable(_)
        )
    }
}

impl From<crate::relay::protocol::ProtocolError> for RelayError {
    fn from(err: crate::relay::protocol::ProtocolError) -> Self {
        RelayError::Protocol(err.to_string())
    }
}
