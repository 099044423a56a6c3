//! Reconnecting event stream client.
//!
//! Owns at most one live stream per session. A background task reads frames,
//! decodes them and hands them to the [`Dispatcher`]; when the stream drops it
//! retries with exponential backoff until the policy's budget runs out.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{RealtimeConfig, ReconnectPolicy};
use crate::dispatcher::Dispatcher;
use crate::error::TransportError;
use crate::event::{StreamEvent, UserId};
use crate::metrics::StreamMetrics;
use crate::sse::SseItem;
use crate::transport::{Transport, redact_url, stream_url};

/// Credentials of the authenticated user the stream is opened for.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub token: String,
}

impl Session {
    pub fn new(user_id: impl Into<UserId>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.user_id.as_str().is_empty() && !self.token.is_empty()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("token", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Observable state of the stream connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Reconnect attempts made since the last successful open.
    pub attempt: u32,
    pub last_error: Option<TransportError>,
    /// When the last bytes (heartbeats and keepalive comments included)
    /// arrived.
    pub last_seen: Option<DateTime<Utc>>,
    pub last_event_id: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            attempt: 0,
            last_error: None,
            last_seen: None,
            last_event_id: None,
        }
    }
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// The server rejected the session's token.
    pub fn session_expired(&self) -> bool {
        self.status == ConnectionStatus::Failed
            && matches!(self.last_error, Some(TransportError::Unauthorized { .. }))
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Running {
    async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!("event stream task panicked: {}", e);
            }
        }
    }
}

pub struct StreamClient {
    events_url: String,
    policy: ReconnectPolicy,
    idle_timeout: Option<Duration>,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    state_tx: watch::Sender<ConnectionState>,
    current: Mutex<Option<Running>>,
}

impl StreamClient {
    pub fn new(config: &RealtimeConfig, transport: Arc<dyn Transport>, dispatcher: Dispatcher) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        Self {
            events_url: config.events_url(),
            policy: config.reconnect.clone(),
            idle_timeout: config.idle_timeout(),
            transport,
            dispatcher,
            state_tx,
            current: Mutex::new(None),
        }
    }

    /// Open the stream for `session`, closing any previous connection first.
    ///
    /// Without a complete session this logs and returns. Never fails: errors
    /// show up in [`ConnectionState`].
    pub async fn connect(&self, session: &Session) {
        if !session.is_complete() {
            warn!("connect called without token or user id, ignoring");
            return;
        }

        let url = match stream_url(&self.events_url, &session.token) {
            Ok(url) => url,
            Err(e) => {
                error!(error = %e, "cannot build event stream url");
                self.state_tx.send_modify(|s| {
                    s.status = ConnectionStatus::Failed;
                    s.last_error = Some(e);
                });
                return;
            }
        };

        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            debug!("closing previous event stream before reconnecting");
            previous.shutdown().await;
        }

        self.state_tx.send_modify(|s| {
            s.status = ConnectionStatus::Connecting;
            s.attempt = 0;
            s.last_error = None;
        });

        let cancel = CancellationToken::new();
        let connection = Connection {
            display_url: redact_url(&url),
            url,
            user_id: session.user_id.clone(),
            policy: self.policy.clone(),
            idle_timeout: self.idle_timeout,
            transport: self.transport.clone(),
            dispatcher: self.dispatcher.clone(),
            state: self.state_tx.clone(),
        };
        let task = tokio::spawn(connection.run(cancel.clone()));
        *current = Some(Running { cancel, task });
    }

    /// Close the stream and cancel any pending reconnect. Idempotent.
    pub async fn disconnect(&self) {
        let previous = self.current.lock().await.take();
        if let Some(previous) = previous {
            previous.shutdown().await;
            info!("event stream disconnected");
        }
        self.state_tx.send_modify(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.attempt = 0;
        });
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state_tx.borrow().status
    }

    pub fn is_connected(&self) -> bool {
        self.state_tx.borrow().is_connected()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        if let Some(running) = self.current.get_mut().take() {
            running.cancel.cancel();
            running.task.abort();
        }
    }
}

/// How one opened-or-attempted stream ended.
struct SessionEnd {
    opened: bool,
    error: TransportError,
}

/// Everything the background task needs; owned by the task.
struct Connection {
    url: String,
    display_url: String,
    user_id: UserId,
    policy: ReconnectPolicy,
    idle_timeout: Option<Duration>,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    state: watch::Sender<ConnectionState>,
}

impl Connection {
    fn metrics(&self) -> &StreamMetrics {
        self.dispatcher.metrics()
    }

    async fn run(self, cancel: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            let end = tokio::select! {
                _ = cancel.cancelled() => return,
                end = self.stream_once() => end,
            };

            if end.opened {
                attempt = 0;
            }

            if !end.error.is_retryable() {
                error!(
                    url = %self.display_url,
                    user = %self.user_id,
                    error = %end.error,
                    "event stream rejected, not retrying"
                );
                self.state.send_modify(|s| {
                    s.status = ConnectionStatus::Failed;
                    s.last_error = Some(end.error);
                });
                return;
            }

            if self.policy.exhausted(attempt) {
                error!(attempts = attempt, error = %end.error, "event stream reconnect budget exhausted");
                self.state.send_modify(|s| {
                    s.status = ConnectionStatus::Failed;
                    s.last_error = Some(end.error);
                });
                return;
            }

            let delay = self.policy.delay_for(attempt);
            attempt += 1;
            self.metrics().reconnect_scheduled();
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %end.error,
                "event stream reconnect scheduled"
            );
            self.state.send_modify(|s| {
                s.status = ConnectionStatus::Reconnecting;
                s.attempt = attempt;
                s.last_error = Some(end.error);
            });

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Open the stream and pump it until it ends.
    async fn stream_once(&self) -> SessionEnd {
        debug!(url = %self.display_url, "opening event stream");
        let mut stream = match self.transport.open(&self.url).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(url = %self.display_url, error = %error, "failed to open event stream");
                return SessionEnd {
                    opened: false,
                    error,
                };
            }
        };

        self.metrics().connection_opened();
        info!(url = %self.display_url, user = %self.user_id, "event stream connected");
        self.state.send_modify(|s| {
            s.status = ConnectionStatus::Connected;
            s.attempt = 0;
            s.last_error = None;
            s.last_seen = Some(Utc::now());
        });

        let error = loop {
            let next = match self.idle_timeout {
                Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => break TransportError::Idle {
                        secs: limit.as_secs(),
                    },
                },
                None => stream.next().await,
            };

            match next {
                Some(Ok(item)) => self.handle_item(item),
                Some(Err(e)) => break e,
                None => break TransportError::Closed,
            }
        };

        warn!(url = %self.display_url, error = %error, "event stream dropped");
        SessionEnd {
            opened: true,
            error,
        }
    }

    fn handle_item(&self, item: SseItem) {
        let frame = match item {
            SseItem::Traffic => {
                self.touch(None);
                return;
            }
            SseItem::Frame(frame) => frame,
        };

        self.metrics().frame_received();
        self.touch(frame.id.clone());

        match StreamEvent::from_frame(&frame) {
            Ok(Some(event)) => {
                if matches!(event, StreamEvent::Heartbeat) {
                    self.metrics().heartbeat();
                    trace!("heartbeat");
                } else {
                    debug!(event = %event.kind(), "event received");
                }
                self.dispatcher.dispatch(&event);
            }
            Ok(None) => {
                self.metrics().frame_ignored();
                debug!(event = %frame.event, "ignoring unknown event type");
            }
            Err(e) => {
                self.metrics().parse_error();
                warn!(error = %e, "dropping malformed frame");
            }
        }
    }

    fn touch(&self, event_id: Option<String>) {
        self.state.send_modify(|s| {
            s.last_seen = Some(Utc::now());
            if event_id.is_some() {
                s.last_event_id = event_id;
            }
        });
    }
}
