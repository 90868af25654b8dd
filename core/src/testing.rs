//! In-memory transport and signal endpoint for tests
//!
//! [`MemoryTransport`] plays scripted relays: each address can accept, refuse
//! or stall the handshake, and accept, reject or ignore reservations.
//! [`MemorySignalConnector`] stands in for the coordination endpoint.

use crate::error::RelayError;
use crate::relay::protocol::{RelayFrame, SignalMessage};
use crate::relay::types::RelayId;
use crate::signal::{SignalConnector, SignalSink, SignalStream};
use crate::transport::{InboundSender, LinkId, RelayLink, RelayTransport, TransportError};
use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HandshakeBehavior {
    #[default]
    Accept,
    Refuse(String),
    /// Never answer; the caller's timeout decides
    Hang,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReservationBehavior {
    #[default]
    Accept,
    Reject(String),
    /// Never answer
    Ignore,
}

/// How a scripted relay behaves
#[derive(Debug, Clone, Default)]
pub struct RelayBehavior {
    pub handshake: HandshakeBehavior,
    pub reservation: ReservationBehavior,
}

#[derive(Default)]
struct TransportState {
    behaviors: HashMap<String, RelayBehavior>,
    connects: HashMap<String, usize>,
    links: HashMap<RelayId, Arc<MemoryLink>>,
}

/// Scripted in-process relays
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<TransportState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, address: &str, behavior: RelayBehavior) {
        self.state.lock().behaviors.insert(address.to_string(), behavior);
    }

    /// Handshakes attempted against `address`
    pub fn connect_count(&self, address: &str) -> usize {
        self.state.lock().connects.get(address).copied().unwrap_or(0)
    }

    /// The most recent link opened to `relay_id`
    pub fn link(&self, relay_id: &RelayId) -> Option<Arc<MemoryLink>> {
        self.state.lock().links.get(relay_id).cloned()
    }
}

#[async_trait]
impl RelayTransport for MemoryTransport {
    async fn connect(
        &self,
        address: String,
        _local_peer_id: String,
        inbound: InboundSender,
    ) -> Result<Arc<dyn RelayLink>, TransportError> {
        let behavior = {
            let mut state = self.state.lock();
            *state.connects.entry(address.clone()).or_insert(0) += 1;
            state.behaviors.get(&address).cloned().unwrap_or_default()
        };

        match behavior.handshake {
            HandshakeBehavior::Accept => {}
            HandshakeBehavior::Refuse(reason) => {
                return Err(TransportError::HandshakeFailed(reason));
            }
            HandshakeBehavior::Hang => {
                futures::future::pending::<()>().await;
            }
        }

        let relay_id = inbound.relay_id().clone();
        let link = Arc::new(MemoryLink {
            reservation: behavior.reservation,
            inbound,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.state.lock().links.insert(relay_id, Arc::clone(&link));
        Ok(link)
    }
}

/// One scripted relay link
pub struct MemoryLink {
    reservation: ReservationBehavior,
    inbound: InboundSender,
    sent: Mutex<Vec<RelayFrame>>,
    closed: AtomicBool,
}

impl MemoryLink {
    /// Frames the client sent on this link
    pub fn sent_frames(&self) -> Vec<RelayFrame> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn link_id(&self) -> LinkId {
        self.inbound.link_id()
    }

    /// Deliver a frame as if the relay sent it
    pub fn inject(&self, frame: RelayFrame) {
        self.inbound.frame(frame);
    }

    /// Drop the link from the relay side
    pub fn sever(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inbound.closed();
        }
    }
}

#[async_trait]
impl RelayLink for MemoryLink {
    async fn send(&self, frame: RelayFrame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::LinkClosed);
        }
        self.sent.lock().push(frame.clone());

        match frame {
            RelayFrame::Reserve { route_id, .. } => match &self.reservation {
                ReservationBehavior::Accept => self.inject(RelayFrame::ReserveAck { route_id }),
                ReservationBehavior::Reject(reason) => self.inject(RelayFrame::ReserveReject {
                    route_id,
                    reason: reason.clone(),
                }),
                ReservationBehavior::Ignore => {}
            },
            RelayFrame::Ping { nonce } => self.inject(RelayFrame::Pong { nonce }),
            _ => {}
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct Session {
    to_client: fmpsc::UnboundedSender<Result<String, RelayError>>,
}

#[derive(Default)]
struct SignalEndpointState {
    refusing: bool,
    connects: usize,
    sessions: Vec<Session>,
    sent: Vec<String>,
}

/// In-process coordination endpoint
#[derive(Clone, Default)]
pub struct MemorySignalConnector {
    state: Arc<Mutex<SignalEndpointState>>,
}

impl MemorySignalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (true) or accept (false) new connections
    pub fn set_refusing(&self, refusing: bool) {
        self.state.lock().refusing = refusing;
    }

    /// Connection attempts so far, successful or not
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    /// Send a text frame to the client on the newest connection
    pub fn push_to_client(&self, text: &str) {
        if let Some(session) = self.state.lock().sessions.last() {
            let _ = session.to_client.unbounded_send(Ok(text.to_string()));
        }
    }

    /// Close every open connection from the endpoint side
    pub fn drop_connections(&self) {
        for session in self.state.lock().sessions.drain(..) {
            session.to_client.close_channel();
        }
    }

    /// Every message clients sent, across all connections
    pub fn sent_messages(&self) -> Vec<SignalMessage> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|text| SignalMessage::from_text(text).ok())
            .collect()
    }
}

#[async_trait]
impl SignalConnector for MemorySignalConnector {
    async fn connect(&self) -> Result<(SignalSink, SignalStream), RelayError> {
        let (tx, rx) = fmpsc::unbounded();
        {
            let mut state = self.state.lock();
            state.connects += 1;
            if state.refusing {
                return Err(RelayError::SignalChannelUnavailable(
                    "connection refused".to_string(),
                ));
            }
            state.sessions.push(Session { to_client: tx });
        }

        let log = Arc::clone(&self.state);
        let sink = futures::sink::unfold((), move |(), text: String| {
            let log = Arc::clone(&log);
            async move {
                log.lock().sent.push(text);
                Ok::<(), RelayError>(())
            }
        });
        let sink: SignalSink = Box::pin(sink);
        let stream: SignalStream = Box::pin(rx);
        Ok((sink, stream))
    }

    fn endpoint(&self) -> String {
        "memory://signal".to_string()
    }
}
