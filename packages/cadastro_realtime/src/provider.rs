//! Process-wide composition of the stream client and the dispatcher, keyed to
//! whether an authenticated session exists.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, watch};
use tracing::{debug, info};

use crate::client::{ConnectionState, ConnectionStatus, Session, StreamClient};
use crate::config::RealtimeConfig;
use crate::dispatcher::{Dispatcher, Subscription};
use crate::event::{EventKind, StreamEvent, UserId};
use crate::metrics::{MetricsSnapshot, StreamMetrics};
use crate::transport::{HttpTransport, Transport};

/// Owns the single stream connection of the process.
///
/// Create one at startup and hand `&StreamProvider` (or an `Arc`) to every
/// view that wants events. Feed it session changes with
/// [`set_session`](Self::set_session); dropping it tears the stream down.
pub struct StreamProvider {
    client: StreamClient,
    dispatcher: Dispatcher,
    session: StdMutex<Option<Session>>,
    // Serializes session transitions so a disconnect/connect pair is never
    // interleaved with another.
    transition: Mutex<()>,
}

impl StreamProvider {
    pub fn new(config: &RealtimeConfig) -> Self {
        Self::with_transport(config, Arc::new(HttpTransport::new()))
    }

    pub fn with_transport(config: &RealtimeConfig, transport: Arc<dyn Transport>) -> Self {
        let dispatcher = Dispatcher::with_metrics(Arc::new(StreamMetrics::new()));
        let client = StreamClient::new(config, transport, dispatcher.clone());
        Self {
            client,
            dispatcher,
            session: StdMutex::new(None),
            transition: Mutex::new(()),
        }
    }

    /// Apply a session change from the auth layer.
    ///
    /// absent → present connects, present → absent disconnects, and a
    /// different user or token is handled as a logout followed by a login.
    /// A session missing its token or user id counts as absent.
    pub async fn set_session(&self, session: Option<Session>) {
        let _guard = self.transition.lock().await;
        let next = session.filter(Session::is_complete);
        let previous = self.current_session();

        match (previous.as_ref(), next.as_ref()) {
            (None, None) => return,
            (Some(old), Some(new)) if old == new => {
                debug!(user = %new.user_id, "session unchanged");
                return;
            }
            (Some(old), None) => {
                info!(user = %old.user_id, "session ended, closing event stream");
                self.client.disconnect().await;
            }
            (None, Some(new)) => {
                info!(user = %new.user_id, "session started, opening event stream");
                self.client.connect(new).await;
            }
            (Some(old), Some(new)) => {
                info!(from = %old.user_id, to = %new.user_id, "session changed, reopening event stream");
                self.client.disconnect().await;
                self.client.connect(new).await;
            }
        }

        *self.lock_session() = next;
    }

    pub async fn start(&self, session: Session) {
        self.set_session(Some(session)).await;
    }

    pub async fn stop(&self) {
        self.set_session(None).await;
    }

    /// Reopen the stream for the current session, e.g. after it reached
    /// `failed`. Does nothing without a session.
    pub async fn reconnect(&self) {
        let _guard = self.transition.lock().await;
        if let Some(session) = self.current_session() {
            info!(user = %session.user_id, "manual reconnect requested");
            self.client.connect(&session).await;
        }
    }

    /// Disconnect regardless of session state and forget the session.
    pub async fn shutdown(&self) {
        let _guard = self.transition.lock().await;
        self.lock_session().take();
        self.client.disconnect().await;
    }

    /// Subscribe by wire event name. Unknown names log and return an inert
    /// handle.
    pub fn registrar_callback<F>(&self, event_type: &str, callback: F) -> Subscription
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe_named(event_type, callback)
    }

    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(kind, callback)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.client.status()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.client.watch_state()
    }

    pub fn current_user(&self) -> Option<UserId> {
        self.lock_session().as_ref().map(|s| s.user_id.clone())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.dispatcher.metrics().snapshot()
    }

    fn current_session(&self) -> Option<Session> {
        self.lock_session().clone()
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedTransport, Step};
    use std::time::Duration;

    fn provider(transport: &ScriptedTransport) -> StreamProvider {
        let config = RealtimeConfig {
            base_url: "http://test/api".to_string(),
            idle_timeout_secs: 0,
            ..Default::default()
        };
        StreamProvider::with_transport(&config, Arc::new(transport.clone()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn login_connects_and_logout_disconnects() {
        let transport = ScriptedTransport::new();
        transport.push(Step::hold(vec![]));
        let p = provider(&transport);

        p.set_session(Some(Session::new("U1", "t1"))).await;
        settle().await;
        assert!(p.is_connected());
        assert_eq!(p.current_user(), Some(UserId::from("U1")));

        p.set_session(None).await;
        assert_eq!(p.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(transport.live(), 0);
        assert_eq!(p.current_user(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn same_session_does_not_reopen() {
        let transport = ScriptedTransport::new();
        transport.push(Step::hold(vec![]));
        let p = provider(&transport);

        p.start(Session::new("U1", "t1")).await;
        p.start(Session::new("U1", "t1")).await;
        settle().await;
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn changed_token_reopens_with_new_token() {
        let transport = ScriptedTransport::new();
        transport.push(Step::hold(vec![]));
        transport.push(Step::hold(vec![]));
        let p = provider(&transport);

        p.start(Session::new("U1", "t1")).await;
        settle().await;
        p.start(Session::new("U1", "t2")).await;
        settle().await;

        let urls = transport.urls();
        assert_eq!(urls.len(), 2);
        assert!(urls[0].ends_with("token=t1"));
        assert!(urls[1].ends_with("token=t2"));
        assert_eq!(transport.max_live(), 1);
        assert!(p.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn incomplete_session_counts_as_absent() {
        let transport = ScriptedTransport::new();
        let p = provider(&transport);
        p.start(Session::new("U1", "")).await;
        settle().await;
        assert_eq!(transport.opens(), 0);
        assert_eq!(p.current_user(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_disconnects_without_session() {
        let transport = ScriptedTransport::new();
        let p = provider(&transport);
        p.shutdown().await;
        p.shutdown().await;
        assert_eq!(p.connection_status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_provider_closes_stream() {
        let transport = ScriptedTransport::new();
        transport.push(Step::hold(vec![]));
        let p = provider(&transport);
        p.start(Session::new("U1", "t1")).await;
        settle().await;
        assert_eq!(transport.live(), 1);

        drop(p);
        settle().await;
        assert_eq!(transport.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_failure() {
        let transport = ScriptedTransport::new();
        transport.push(Step::unauthorized());
        transport.push(Step::hold(vec![]));
        let p = provider(&transport);

        p.start(Session::new("U1", "t1")).await;
        settle().await;
        assert!(p.connection_state().session_expired());

        p.reconnect().await;
        settle().await;
        assert!(p.is_connected());
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn registrar_callback_by_name() {
        let transport = ScriptedTransport::new();
        let p = provider(&transport);
        let ok = p.registrar_callback("recordDeleted", |_| {});
        let typo = p.registrar_callback("recordDeletd", |_| {});
        assert!(ok.is_active());
        assert!(!typo.is_active());
        assert_eq!(p.dispatcher().subscriber_count(EventKind::RecordDeleted), 1);
    }
}
