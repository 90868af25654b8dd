//! Circuit relay: registry, connections, routes and payload forwarding

pub mod connection;
pub mod messaging;
pub mod protocol;
pub mod registry;
pub mod route;
pub mod server;
pub mod types;

pub use connection::{ConnectionSettings, RelayConnectionManager};
pub use messaging::MessageRelay;
pub use protocol::{ProtocolError, RelayFrame, SignalMessage, PROTOCOL_VERSION};
pub use registry::RelayRegistry;
pub use route::{InboundRefusal, RouteManager, RouteTable};
pub use server::{RelayServer, RelayServerConfig, RelayServerError, RelayServerStats};
pub use types::{RelayId, RelayInfo, RelayRoute, RelayType, RouteDirection, RouteId, RouteState};
