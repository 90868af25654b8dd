//! Circuit Relay Protocol — frames, framing and control-channel messages

use super::types::{current_unix_millis, RouteId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single encoded frame
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A frame exchanged between a peer and a relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// Handshake: initial connection negotiation
    Handshake {
        /// Protocol version
        version: u32,
        /// Sender's peer ID
        peer_id: String,
    },
    /// Handshake acknowledgment
    HandshakeAck {
        /// Protocol version
        version: u32,
        /// Relay's own peer ID
        relay_peer_id: String,
    },
    /// Ask the relay to reserve a route to `target_peer_id`
    Reserve {
        route_id: RouteId,
        target_peer_id: String,
    },
    /// Reservation accepted; the route is usable
    ReserveAck { route_id: RouteId },
    /// Reservation refused
    ReserveReject { route_id: RouteId, reason: String },
    /// Relay → target: a remote peer opened a route to us
    IncomingRoute {
        route_id: RouteId,
        source_peer_id: String,
    },
    /// Application payload on a route
    Data { route_id: RouteId, payload: Vec<u8> },
    /// Route teardown, in either direction
    CloseRoute { route_id: RouteId },
    /// Latency probe
    Ping { nonce: u64 },
    /// Probe response
    Pong { nonce: u64 },
    /// Graceful disconnect
    Disconnect {
        /// Reason for disconnect
        reason: String,
    },
}

/// Frame serialization errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid frame length: {0}")]
    InvalidLength(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayFrame {
    /// Serialize a frame to bytes using bincode
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize a frame from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// The route this frame belongs to, if it is route-scoped
    pub fn route_id(&self) -> Option<&RouteId> {
        match self {
            RelayFrame::Reserve { route_id, .. }
            | RelayFrame::ReserveAck { route_id }
            | RelayFrame::ReserveReject { route_id, .. }
            | RelayFrame::IncomingRoute { route_id, .. }
            | RelayFrame::Data { route_id, .. }
            | RelayFrame::CloseRoute { route_id } => Some(route_id),
            _ => None,
        }
    }

    /// Get a human-readable description of the frame type
    pub fn frame_type(&self) -> &'static str {
        match self {
            RelayFrame::Handshake { .. } => "Handshake",
            RelayFrame::HandshakeAck { .. } => "HandshakeAck",
            RelayFrame::Reserve { .. } => "Reserve",
            RelayFrame::ReserveAck { .. } => "ReserveAck",
            RelayFrame::ReserveReject { .. } => "ReserveReject",
            RelayFrame::IncomingRoute { .. } => "IncomingRoute",
            RelayFrame::Data { .. } => "Data",
            RelayFrame::CloseRoute { .. } => "CloseRoute",
            RelayFrame::Ping { .. } => "Ping",
            RelayFrame::Pong { .. } => "Pong",
            RelayFrame::Disconnect { .. } => "Disconnect",
        }
    }
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, frame: &RelayFrame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let payload = frame.to_bytes()?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::InvalidLength(payload.len()));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame
pub async fn read_frame<R>(reader: &mut R) -> Result<RelayFrame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(ProtocolError::InvalidLength(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    RelayFrame::from_bytes(&buf)
}

/// Control-channel message, carried as a JSON text frame:
/// `{ "type": string, "data"?: object, "timestamp": number }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: u64,
}

impl SignalMessage {
    pub fn new(message_type: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            message_type: message_type.into(),
            data,
            timestamp: current_unix_millis(),
        }
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// String field from `data`, if present
    pub fn data_str(&self, field: &str) -> Option<&str> {
        self.data.as_ref()?.get(field)?.as_str()
    }
}

// ============================================================================
// TESTS
// ============================================================================
