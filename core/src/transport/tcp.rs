//! TCP relay transport: length-prefixed frames over a plain TCP stream

use super::abstraction::{InboundSender, RelayLink, RelayTransport, TransportError};
use crate::relay::protocol::{read_frame, write_frame, RelayFrame, PROTOCOL_VERSION};
use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Dials relays over TCP. Addresses may carry a `tcp://` prefix.
#[derive(Debug, Clone, Default)]
pub struct TcpRelayTransport;

impl TcpRelayTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RelayTransport for TcpRelayTransport {
    async fn connect(
        &self,
        address: String,
        local_peer_id: String,
        inbound: InboundSender,
    ) -> Result<Arc<dyn RelayLink>, TransportError> {
        let dial_addr = address.strip_prefix("tcp://").unwrap_or(&address);
        let mut stream = TcpStream::connect(dial_addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        let handshake = RelayFrame::Handshake {
            version: PROTOCOL_VERSION,
            peer_id: local_peer_id,
        };
        write_frame(&mut stream, &handshake)
            .await
            .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;

        let relay_peer_id = match read_frame(&mut stream).await {
            Ok(RelayFrame::HandshakeAck {
                version,
                relay_peer_id,
            }) => {
                if version != PROTOCOL_VERSION {
                    return Err(TransportError::HandshakeFailed(
                        "Version mismatch".to_string(),
                    ));
                }
                relay_peer_id
            }
            Ok(RelayFrame::Disconnect { reason }) => {
                return Err(TransportError::HandshakeFailed(reason));
            }
            Ok(other) => {
                return Err(TransportError::HandshakeFailed(format!(
                    "Unexpected response: {}",
                    other.frame_type()
                )));
            }
            Err(e) => return Err(TransportError::HandshakeFailed(e.to_string())),
        };
        debug!(
            "Handshake with relay {} complete ({}), link {}",
            inbound.relay_id(),
            relay_peer_id,
            inbound.link_id()
        );

        let (mut reader, writer) = stream.into_split();
        let closed = Arc::new(AtomicBool::new(false));

        let reader_closed = Arc::clone(&closed);
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(frame) => {
                        trace!("{} from relay {}", frame.frame_type(), inbound.relay_id());
                        if !inbound.frame(frame) {
                            break;
                        }
                    }
                    Err(e) => {
                        if !reader_closed.swap(true, Ordering::SeqCst) {
                            debug!("Relay {} stream ended: {}", inbound.relay_id(), e);
                            inbound.closed();
                        }
                        break;
                    }
                }
            }
        });

        Ok(Arc::new(TcpRelayLink {
            relay_peer_id,
            writer: Mutex::new(writer),
            closed,
            reader_task: SyncMutex::new(Some(reader_task)),
        }))
    }
}

/// An open TCP connection to one relay
pub struct TcpRelayLink {
    relay_peer_id: String,
    writer: Mutex<OwnedWriteHalf>,
    closed: Arc<AtomicBool>,
    reader_task: SyncMutex<Option<JoinHandle<()>>>,
}

impl TcpRelayLink {
    /// The peer ID the relay announced in its handshake
    pub fn relay_peer_id(&self) -> &str {
        &self.relay_peer_id
    }
}

#[async_trait]
impl RelayLink for TcpRelayLink {
    async fn send(&self, frame: RelayFrame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::LinkClosed);
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &frame)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let goodbye = RelayFrame::Disconnect {
            reason: "client closing".to_string(),
        };
        let _ = write_frame(&mut *writer, &goodbye).await;
        let _ = writer.shutdown().await;
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for TcpRelayLink {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
    }
}
