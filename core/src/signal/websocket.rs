//! WebSocket signal connector

use super::{SignalConnector, SignalSink, SignalStream};
use crate::error::RelayError;
use async_trait::async_trait;
use futures::{future, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Dials a `ws://` or `wss://` coordination endpoint
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

fn unavailable(e: impl ToString) -> RelayError {
    RelayError::SignalChannelUnavailable(e.to_string())
}

#[async_trait]
impl SignalConnector for WebSocketConnector {
    async fn connect(&self) -> Result<(SignalSink, SignalStream), RelayError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(unavailable)?;
        let (ws_write, ws_read) = ws_stream.split();

        let sink = ws_write
            .sink_map_err(unavailable)
            .with(|text: String| future::ok::<Message, RelayError>(Message::Text(text)));

        let stream = ws_read.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        debug!("Ignoring non-UTF-8 binary signal frame");
                        None
                    }
                },
                Ok(_) => None,
                Err(e) => Some(Err(unavailable(e))),
            })
        });

        let sink: SignalSink = Box::pin(sink);
        let stream: SignalStream = Box::pin(stream);
        Ok((sink, stream))
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}
