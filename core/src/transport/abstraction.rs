//! Transport abstraction layer
//!
//! The relay service never opens sockets itself. A [`RelayTransport`] opens a
//! [`RelayLink`] to one relay (including the protocol handshake) and reports
//! every inbound frame, plus the link's eventual closure, through the
//! [`InboundSender`] it was handed at connect time. Each sender is bound to
//! one link, so events from a replaced link can be told apart from the
//! current one.

use crate::relay::protocol::RelayFrame;
use crate::relay::types::RelayId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Link closed")]
    LinkClosed,
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Something that happened on a relay link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Frame(RelayFrame),
    /// The link is gone; no further frames follow
    Closed,
}

/// Identifies one link among all links ever opened by a connection manager
pub type LinkId = u64;

/// A link event attributed to the relay and link it arrived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub relay_id: RelayId,
    pub link_id: LinkId,
    pub event: LinkEvent,
}

impl fmt::Display for InboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.event {
            LinkEvent::Frame(frame) => write!(f, "{} from {}", frame.frame_type(), self.relay_id),
            LinkEvent::Closed => write!(f, "link to {} closed", self.relay_id),
        }
    }
}

#[derive(Default)]
struct Gate {
    open: bool,
    held: Vec<LinkEvent>,
}

/// Reports inbound traffic for one link.
///
/// Events pushed before [`InboundSender::open`] are held and forwarded, in
/// order, when the owner opens the sender. A sender that is never opened
/// never forwards anything.
#[derive(Clone)]
pub struct InboundSender {
    relay_id: RelayId,
    link_id: LinkId,
    tx: mpsc::UnboundedSender<InboundFrame>,
    gate: Arc<Mutex<Gate>>,
}

impl InboundSender {
    pub fn new(relay_id: RelayId, link_id: LinkId, tx: mpsc::UnboundedSender<InboundFrame>) -> Self {
        Self {
            relay_id,
            link_id,
            tx,
            gate: Arc::new(Mutex::new(Gate::default())),
        }
    }

    pub fn relay_id(&self) -> &RelayId {
        &self.relay_id
    }

    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    /// Report a frame. False once nobody is listening any more.
    pub fn frame(&self, frame: RelayFrame) -> bool {
        self.push(LinkEvent::Frame(frame))
    }

    /// Report that the link went away on its own
    pub fn closed(&self) {
        self.push(LinkEvent::Closed);
    }

    /// Start forwarding, releasing anything held so far
    pub fn open(&self) {
        let mut gate = self.gate.lock();
        for event in std::mem::take(&mut gate.held) {
            let _ = self.tx.send(self.wrap(event));
        }
        gate.open = true;
    }

    fn push(&self, event: LinkEvent) -> bool {
        let mut gate = self.gate.lock();
        if !gate.open {
            gate.held.push(event);
            return !self.tx.is_closed();
        }
        self.tx.send(self.wrap(event)).is_ok()
    }

    fn wrap(&self, event: LinkEvent) -> InboundFrame {
        InboundFrame {
            relay_id: self.relay_id.clone(),
            link_id: self.link_id,
            event,
        }
    }
}

/// One open connection to one relay
#[async_trait]
pub trait RelayLink: Send + Sync {
    /// Hand a frame to the transport. Success means queued, not delivered.
    async fn send(&self, frame: RelayFrame) -> Result<(), TransportError>;

    /// Close the link. Must not report `LinkEvent::Closed` for a link closed
    /// this way.
    async fn close(&self);
}

/// Opens links to relays
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open a link to `address` and complete the relay handshake. The relay
    /// and link the sender is bound to identify the new link.
    async fn connect(
        &self,
        address: String,
        local_peer_id: String,
        inbound: InboundSender,
    ) -> Result<Arc<dyn RelayLink>, TransportError>;
}
