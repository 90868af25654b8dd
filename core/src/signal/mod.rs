//! Signal channel — persistent control connection to the coordination endpoint
//!
//! One supervisor task owns the connection. It connects, pumps outbound and
//! inbound text frames, and on an unexpected drop consults the
//! [`ReconnectPolicy`] for when to try again. Topic subscriptions are
//! remembered and re-sent after every successful (re)connect.

pub mod reconnect;
pub mod websocket;

pub use reconnect::{ReconnectDecision, ReconnectPolicy};
pub use websocket::WebSocketConnector;

use crate::error::RelayError;
use crate::events::{CircuitRelayEvent, EventBus};
use crate::relay::protocol::SignalMessage;
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

/// Outbound half of a signal connection
pub type SignalSink = Pin<Box<dyn Sink<String, Error = RelayError> + Send>>;
/// Inbound half of a signal connection
pub type SignalStream = Pin<Box<dyn Stream<Item = Result<String, RelayError>> + Send>>;

/// Opens text-frame connections to the coordination endpoint
#[async_trait]
pub trait SignalConnector: Send + Sync {
    async fn connect(&self) -> Result<(SignalSink, SignalStream), RelayError>;

    /// Where this connector dials, for logs
    fn endpoint(&self) -> String;
}

/// Signal channel timing
#[derive(Debug, Clone)]
pub struct SignalSettings {
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
}

#[derive(Default)]
struct SignalState {
    outbound: Option<mpsc::UnboundedSender<String>>,
    topics: BTreeSet<String>,
    attempt: u32,
    supervisor: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

struct Shared {
    connector: Arc<dyn SignalConnector>,
    settings: SignalSettings,
    events: EventBus,
    state: Mutex<SignalState>,
    inbound: mpsc::UnboundedSender<SignalMessage>,
}

pub struct SignalChannel {
    shared: Arc<Shared>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalMessage>>>,
}

impl SignalChannel {
    pub fn new(connector: Arc<dyn SignalConnector>, settings: SignalSettings, events: EventBus) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                connector,
                settings,
                events,
                state: Mutex::new(SignalState::default()),
                inbound: tx,
            }),
            inbound_rx: Mutex::new(Some(rx)),
        }
    }

    /// Inbound control messages. Can be taken once.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<SignalMessage>> {
        self.inbound_rx.lock().take()
    }

    /// Start the supervisor and wait for the first attempt.
    ///
    /// A failed first attempt is returned as an error, but the supervisor
    /// keeps retrying in the background. Calling this while the supervisor
    /// runs does nothing.
    pub async fn connect(&self) -> Result<(), RelayError> {
        let first_rx = {
            let mut state = self.shared.state.lock();
            if state.supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
                return Ok(());
            }
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let (first_tx, first_rx) = oneshot::channel();
            let shared = Arc::clone(&self.shared);
            state.shutdown = Some(shutdown_tx);
            state.supervisor = Some(tokio::spawn(supervise(shared, shutdown_rx, first_tx)));
            first_rx
        };

        first_rx.await.unwrap_or_else(|_| {
            Err(RelayError::SignalChannelUnavailable(
                "signal supervisor stopped".to_string(),
            ))
        })
    }

    /// Stop the supervisor and close the connection
    pub async fn disconnect(&self) {
        let (shutdown, supervisor) = {
            let mut state = self.shared.state.lock();
            (state.shutdown.take(), state.supervisor.take())
        };
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().outbound.is_some()
    }

    /// Reconnect attempts since the last successful connection
    pub fn reconnect_attempt(&self) -> u32 {
        self.shared.state.lock().attempt
    }

    pub fn endpoint(&self) -> String {
        self.shared.connector.endpoint()
    }

    /// Send a control message
    pub fn send(&self, message_type: &str, data: Option<serde_json::Value>) -> Result<(), RelayError> {
        self.shared.send(SignalMessage::new(message_type, data))
    }

    /// Subscribe to a topic; remembered across reconnects
    pub fn subscribe(&self, topic: &str) -> Result<(), RelayError> {
        let connected = {
            let mut state = self.shared.state.lock();
            state.topics.insert(topic.to_string());
            state.outbound.is_some()
        };
        if connected {
            self.shared.send(topic_message("subscribe", topic))?;
        }
        Ok(())
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<(), RelayError> {
        let (removed, connected) = {
            let mut state = self.shared.state.lock();
            (state.topics.remove(topic), state.outbound.is_some())
        };
        if removed && connected {
            self.shared.send(topic_message("unsubscribe", topic))?;
        }
        Ok(())
    }

    pub fn topics(&self) -> Vec<String> {
        self.shared.state.lock().topics.iter().cloned().collect()
    }
}

impl Drop for SignalChannel {
    fn drop(&mut self) {
        if let Some(task) = self.shared.state.lock().supervisor.take() {
            task.abort();
        }
    }
}

impl Shared {
    fn send(&self, message: SignalMessage) -> Result<(), RelayError> {
        let text = message
            .to_text()
            .map_err(|e| RelayError::Protocol(e.to_string()))?;
        let outbound = self.state.lock().outbound.clone();
        match outbound {
            Some(tx) => tx.send(text).map_err(|_| {
                RelayError::SignalChannelUnavailable("connection closing".to_string())
            }),
            None => Err(RelayError::SignalChannelUnavailable(
                "not connected".to_string(),
            )),
        }
    }
}

fn topic_message(kind: &str, topic: &str) -> SignalMessage {
    SignalMessage::new(kind, Some(serde_json::json!({ "topic": topic })))
}

async fn supervise(
    shared: Arc<Shared>,
    mut shutdown: oneshot::Receiver<()>,
    first: oneshot::Sender<Result<(), RelayError>>,
) {
    let settings = shared.settings.clone();
    let mut policy = ReconnectPolicy::new(settings.reconnect_interval, settings.max_reconnect_attempts);
    let mut first = Some(first);
    let endpoint = shared.connector.endpoint();

    loop {
        let attempt = tokio::select! {
            _ = &mut shutdown => break,
            result = timeout(settings.connect_timeout, shared.connector.connect()) => result,
        };

        match attempt {
            Ok(Ok((sink, stream))) => {
                policy.on_connected();
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let topics = {
                    let mut state = shared.state.lock();
                    state.outbound = Some(out_tx.clone());
                    state.attempt = 0;
                    state.topics.clone()
                };
                for topic in &topics {
                    if let Ok(text) = topic_message("subscribe", topic).to_text() {
                        let _ = out_tx.send(text);
                    }
                }
                drop(out_tx);

                info!("Signal channel connected to {}", endpoint);
                shared.events.publish(CircuitRelayEvent::SignalConnected);
                if let Some(first) = first.take() {
                    let _ = first.send(Ok(()));
                }

                let stopped = pump(sink, stream, out_rx, &mut shutdown, &shared.inbound).await;
                shared.state.lock().outbound = None;
                if stopped {
                    break;
                }
                warn!("Signal channel to {} closed unexpectedly", endpoint);
            }
            Ok(Err(e)) => {
                warn!("Signal channel connect to {} failed: {}", endpoint, e);
                if let Some(first) = first.take() {
                    let _ = first.send(Err(e));
                }
            }
            Err(_) => {
                warn!("Signal channel connect to {} timed out", endpoint);
                if let Some(first) = first.take() {
                    let _ = first.send(Err(RelayError::ConnectionTimeout(endpoint.clone())));
                }
            }
        }

        match policy.on_connection_lost(Instant::now()) {
            ReconnectDecision::GiveUp { attempts } => {
                let message = format!(
                    "Signal channel unavailable after {} reconnect attempts",
                    attempts
                );
                warn!("{}", message);
                shared.events.publish(CircuitRelayEvent::error(message));
                break;
            }
            ReconnectDecision::RetryAt { attempt, at } => {
                shared.state.lock().attempt = attempt;
                debug!("Signal reconnect attempt {} in {:?}", attempt, at - Instant::now());
                shared.events.publish(CircuitRelayEvent::SignalReconnecting {
                    attempt,
                    max_attempts: policy.max_attempts(),
                });
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = sleep_until(at) => {}
                }
            }
        }
    }

    shared.state.lock().outbound = None;
}

/// Move frames until the connection ends. True if we were told to stop.
async fn pump(
    mut sink: SignalSink,
    mut stream: SignalStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    shutdown: &mut oneshot::Receiver<()>,
    inbound: &mpsc::UnboundedSender<SignalMessage>,
) -> bool {
    loop {
        tokio::select! {
            _ = &mut *shutdown => {
                let _ = sink.close().await;
                return true;
            }
            Some(text) = outbound.recv() => {
                if let Err(e) = sink.send(text).await {
                    warn!("Signal send failed: {}", e);
                    return false;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(text)) => match SignalMessage::from_text(&text) {
                    Ok(message) => {
                        debug!("Signal message {}", message.message_type);
                        let _ = inbound.send(message);
                    }
                    Err(e) => debug!("Dropping malformed signal message: {}", e),
                },
                Some(Err(e)) => {
                    warn!("Signal receive failed: {}", e);
                    return false;
                }
                None => return false,
            },
        }
    }
}
