// Circuit Relay — reach peers you cannot dial directly
//
// Keeps a small set of relay connections up, reserves routes through them,
// forwards payloads, and holds a control channel to the coordination
// endpoint. Everything observable is published on one event bus.

pub mod config;
pub mod error;
pub mod events;
pub mod relay;
pub mod service;
pub mod signal;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::CircuitRelayConfig;
pub use error::RelayError;
pub use events::{CircuitRelayEvent, EventBus, EventListener, EventSubscription, SubscriptionId};
pub use relay::{
    RelayFrame, RelayId, RelayInfo, RelayRoute, RelayServer, RelayServerConfig, RelayType,
    RouteDirection, RouteId, RouteState,
};
pub use service::{RelayService, ServiceStatus};
pub use signal::{SignalChannel, SignalConnector, WebSocketConnector};
pub use transport::{RelayLink, RelayTransport, TcpRelayTransport};

/// Install a `tracing` subscriber honoring `RUST_LOG` (default `info`).
/// Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }

    #[tokio::test]
    async fn test_independent_instances() {
        let a = RelayService::new(
            CircuitRelayConfig::default(),
            Arc::new(testing::MemoryTransport::new()),
        )
        .unwrap();
        let b = RelayService::new(
            CircuitRelayConfig::default(),
            Arc::new(testing::MemoryTransport::new()),
        )
        .unwrap();

        a.add_relay("relay:1", RelayType::Public).unwrap();

        assert_eq!(a.get_all_relays().len(), 1);
        assert!(b.get_all_relays().is_empty());
    }
}
