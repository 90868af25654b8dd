// Transport: links from this peer to relays

pub mod abstraction;
pub mod tcp;

pub use abstraction::{
    InboundFrame, InboundSender, LinkEvent, LinkId, RelayLink, RelayTransport, TransportError,
};
#[cfg(test)]
pub use abstraction::MockRelayTransport;
pub use tcp::{TcpRelayLink, TcpRelayTransport};
