//! Edit-conflict detection for a view showing one record.
//!
//! [`ConflictTracker`] is the pure state machine; [`ConflictDetector`] wires
//! it to a [`Dispatcher`] and drives the deletion countdown.
//!
//! ```text
//! Clean ──updated by other──▶ ConflictPendingUpdate ──reload / dismiss──▶ Clean
//!   │                                   │
//!   └──────────deleted──────────────────┴──▶ PendingDeletion ──countdown──▶ Closed
//! ```

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, Subscription};
use crate::error::RecordError;
use crate::event::{EventEnvelope, EventKind, RecordId, StreamEvent, UserId};
use crate::records::{RecordSource, Resource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictKind {
    None,
    EditedByOther,
    DeletedByOther,
}

/// What the view should show about concurrent changes to its record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictState {
    pub kind: ConflictKind,
    pub author_id: Option<UserId>,
    pub author_role: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Seconds left before the view closes itself; set only for
    /// `DeletedByOther`.
    pub close_countdown_seconds: Option<u32>,
}

impl Default for ConflictState {
    fn default() -> Self {
        Self {
            kind: ConflictKind::None,
            author_id: None,
            author_role: None,
            timestamp: None,
            close_countdown_seconds: None,
        }
    }
}

impl ConflictState {
    fn from_envelope(kind: ConflictKind, env: &EventEnvelope) -> Self {
        Self {
            kind,
            author_id: Some(env.author_id.clone()),
            author_role: env.author_role.clone(),
            timestamp: Some(env.timestamp),
            close_countdown_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ViewPhase {
    Clean,
    ConflictPendingUpdate,
    PendingDeletion,
    Closed,
}

/// Outcome of feeding one event to a [`ConflictTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    Ignored,
    Conflict,
    DeletionStarted,
}

/// Outcome of one countdown second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Remaining(u32),
    Close,
    /// No countdown is running.
    Idle,
}

#[derive(Debug, Clone)]
pub struct ConflictTracker {
    record_id: RecordId,
    current_user: UserId,
    countdown_secs: u32,
    phase: ViewPhase,
    state: ConflictState,
}

impl ConflictTracker {
    pub fn new(record_id: impl Into<RecordId>, current_user: impl Into<UserId>, countdown_secs: u32) -> Self {
        Self {
            record_id: record_id.into(),
            current_user: current_user.into(),
            countdown_secs,
            phase: ViewPhase::Clean,
            state: ConflictState::default(),
        }
    }

    pub fn record_id(&self) -> &RecordId {
        &self.record_id
    }

    pub fn phase(&self) -> ViewPhase {
        self.phase
    }

    pub fn state(&self) -> &ConflictState {
        &self.state
    }

    /// Saving is allowed until a deletion is observed.
    pub fn can_edit(&self) -> bool {
        matches!(self.phase, ViewPhase::Clean | ViewPhase::ConflictPendingUpdate)
    }

    pub fn observe(&mut self, event: &StreamEvent) -> Reaction {
        let (deleted, env) = match event {
            StreamEvent::RecordUpdated(env) => (false, env),
            StreamEvent::RecordDeleted(env) => (true, env),
            _ => return Reaction::Ignored,
        };
        if env.record.id != self.record_id || !self.can_edit() {
            return Reaction::Ignored;
        }

        if deleted {
            // Applies to our own deletions too: the record is gone either way.
            self.phase = ViewPhase::PendingDeletion;
            self.state = ConflictState {
                close_countdown_seconds: Some(self.countdown_secs),
                ..ConflictState::from_envelope(ConflictKind::DeletedByOther, env)
            };
            return Reaction::DeletionStarted;
        }

        if env.author_id == self.current_user {
            return Reaction::Ignored;
        }
        self.phase = ViewPhase::ConflictPendingUpdate;
        self.state = ConflictState::from_envelope(ConflictKind::EditedByOther, env);
        Reaction::Conflict
    }

    /// Advance the deletion countdown by one second.
    pub fn tick(&mut self) -> Tick {
        if self.phase != ViewPhase::PendingDeletion {
            return Tick::Idle;
        }
        let remaining = self
            .state
            .close_countdown_seconds
            .unwrap_or(0)
            .saturating_sub(1);
        self.state.close_countdown_seconds = Some(remaining);
        if remaining == 0 {
            self.phase = ViewPhase::Closed;
            Tick::Close
        } else {
            Tick::Remaining(remaining)
        }
    }

    /// Drop an edit conflict without refetching. Returns whether anything
    /// changed.
    pub fn dismiss(&mut self) -> bool {
        if self.phase != ViewPhase::ConflictPendingUpdate {
            return false;
        }
        self.phase = ViewPhase::Clean;
        self.state = ConflictState::default();
        true
    }

    /// The view now shows the server's copy.
    pub fn reloaded(&mut self) {
        if self.can_edit() {
            self.phase = ViewPhase::Clean;
            self.state = ConflictState::default();
        }
    }

    pub fn close(&mut self) {
        self.phase = ViewPhase::Closed;
        self.state = ConflictState::default();
    }
}

/// The record a view currently displays.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordView {
    pub resource: Resource,
    pub id: RecordId,
    pub data: Value,
}

type CloseFn = Box<dyn FnOnce() + Send>;

struct Shared {
    tracker: Mutex<ConflictTracker>,
    view: Mutex<RecordView>,
    state_tx: watch::Sender<ConflictState>,
    on_close: Mutex<Option<CloseFn>>,
    cancel: CancellationToken,
    runtime: Option<Handle>,
}

impl Shared {
    fn tracker(&self) -> MutexGuard<'_, ConflictTracker> {
        self.tracker.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn view(&self) -> MutexGuard<'_, RecordView> {
        self.view.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: ConflictState) {
        self.state_tx.send_replace(state);
    }

    fn fire_close(&self) {
        let close = self.on_close.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(close) = close {
            close();
        }
    }

    fn on_event(self: &Arc<Self>, event: &StreamEvent) {
        let (reaction, state) = {
            let mut tracker = self.tracker();
            let reaction = tracker.observe(event);
            (reaction, tracker.state().clone())
        };

        match reaction {
            Reaction::Ignored => {}
            Reaction::Conflict => {
                info!(
                    record = %self.view().id,
                    author = ?state.author_id,
                    role = ?state.author_role,
                    "record edited by another user"
                );
                self.publish(state);
            }
            Reaction::DeletionStarted => {
                let secs = state.close_countdown_seconds.unwrap_or(0);
                info!(record = %self.view().id, secs, "record deleted, closing view");
                self.publish(state);
                self.start_countdown();
            }
        }
    }

    fn start_countdown(self: &Arc<Self>) {
        let Some(runtime) = self.runtime.clone() else {
            warn!("no runtime for deletion countdown, closing view immediately");
            self.tracker().close();
            self.fire_close();
            return;
        };

        let weak: Weak<Shared> = Arc::downgrade(self);
        let cancel = self.cancel.child_token();
        runtime.spawn(async move {
            let period = Duration::from_secs(1);
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticks.tick() => {}
                }
                let Some(shared) = weak.upgrade() else { return };
                let (tick, state) = {
                    let mut tracker = shared.tracker();
                    let tick = tracker.tick();
                    (tick, tracker.state().clone())
                };
                match tick {
                    Tick::Remaining(n) => {
                        debug!(remaining = n, "deletion countdown");
                        shared.publish(state);
                    }
                    Tick::Close => {
                        shared.publish(state);
                        shared.fire_close();
                        return;
                    }
                    Tick::Idle => return,
                }
            }
        });
    }
}

/// Watches one displayed record for changes made elsewhere.
///
/// Dropping the detector unsubscribes and cancels a running countdown, so
/// `on_close` is never called for a view that is already gone.
pub struct ConflictDetector {
    shared: Arc<Shared>,
    _subscriptions: Vec<Subscription>,
}

impl ConflictDetector {
    /// Start watching `view` for `current_user`. `on_close` runs at most once,
    /// when the deletion countdown reaches zero.
    pub fn open<F>(
        dispatcher: &Dispatcher,
        view: RecordView,
        current_user: impl Into<UserId>,
        countdown_secs: u32,
        on_close: F,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let tracker = ConflictTracker::new(view.id.clone(), current_user, countdown_secs);
        let (state_tx, _) = watch::channel(ConflictState::default());
        let shared = Arc::new(Shared {
            tracker: Mutex::new(tracker),
            view: Mutex::new(view),
            state_tx,
            on_close: Mutex::new(Some(Box::new(on_close))),
            cancel: CancellationToken::new(),
            runtime: Handle::try_current().ok(),
        });

        let subscriptions = [EventKind::RecordUpdated, EventKind::RecordDeleted]
            .into_iter()
            .map(|kind| {
                let weak = Arc::downgrade(&shared);
                dispatcher.subscribe(kind, move |event| {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_event(event);
                    }
                })
            })
            .collect();

        Self {
            shared,
            _subscriptions: subscriptions,
        }
    }

    pub fn state(&self) -> ConflictState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn phase(&self) -> ViewPhase {
        self.shared.tracker().phase()
    }

    pub fn watch(&self) -> watch::Receiver<ConflictState> {
        self.shared.state_tx.subscribe()
    }

    pub fn can_edit(&self) -> bool {
        self.shared.tracker().can_edit()
    }

    /// The form data currently shown, stale or not.
    pub fn displayed(&self) -> Value {
        self.shared.view().data.clone()
    }

    pub fn view(&self) -> RecordView {
        self.shared.view().clone()
    }

    /// Our own save succeeded; the local copy is authoritative again.
    ///
    /// Returns `false` once editing is disabled.
    pub fn record_saved(&self, data: Value) -> bool {
        let mut tracker = self.shared.tracker();
        if !tracker.can_edit() {
            return false;
        }
        self.shared.view().data = data;
        tracker.reloaded();
        self.shared.publish(tracker.state().clone());
        true
    }

    /// Re-fetch the record and replace the displayed data wholesale.
    ///
    /// Does nothing while a deletion countdown runs or after close.
    pub async fn reload(&self, source: &dyn RecordSource) -> Result<(), RecordError> {
        if !self.can_edit() {
            return Ok(());
        }
        let (resource, id) = {
            let view = self.shared.view();
            (view.resource, view.id.clone())
        };
        let data = source.fetch(resource, &id).await?;

        let mut tracker = self.shared.tracker();
        // A deletion may have landed while the request was in flight.
        if !tracker.can_edit() {
            return Ok(());
        }
        self.shared.view().data = data;
        tracker.reloaded();
        self.shared.publish(tracker.state().clone());
        info!(%resource, %id, "record reloaded");
        Ok(())
    }

    pub fn dismiss(&self) {
        let mut tracker = self.shared.tracker();
        if tracker.dismiss() {
            self.shared.publish(tracker.state().clone());
        }
    }

    /// The view is closing on its own. Cancels any countdown; `on_close` is
    /// not invoked.
    pub fn close(&self) {
        self.shared.cancel.cancel();
        let mut tracker = self.shared.tracker();
        tracker.close();
        self.shared.publish(tracker.state().clone());
    }
}

impl Drop for ConflictDetector {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
