//! Callback registry keyed by [`EventKind`].
//!
//! Callbacks run synchronously on the task that decoded the frame, in
//! registration order. The registry lock is never held while a callback runs,
//! so callbacks may subscribe or unsubscribe (themselves included) freely.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, error, warn};

use crate::event::{EventKind, StreamEvent};
use crate::metrics::StreamMetrics;

pub type Callback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

struct Entry {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback,
}

struct Registry {
    lists: Mutex<HashMap<EventKind, Vec<Entry>>>,
    next_id: AtomicU64,
    metrics: Arc<StreamMetrics>,
}

impl Registry {
    fn lists(&self) -> MutexGuard<'_, HashMap<EventKind, Vec<Entry>>> {
        // Callbacks never run under this lock, so a poisoned guard still
        // holds a consistent map.
        self.lists.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, kind: EventKind, id: u64) {
        let mut lists = self.lists();
        if let Some(list) = lists.get_mut(&kind) {
            list.retain(|e| e.id != id);
            if list.is_empty() {
                lists.remove(&kind);
            }
        }
    }
}

/// Fans each decoded event out to the callbacks registered for its kind.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Registry>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(StreamMetrics::new()))
    }

    pub fn with_metrics(metrics: Arc<StreamMetrics>) -> Self {
        Self {
            inner: Arc::new(Registry {
                lists: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                metrics,
            }),
        }
    }

    /// Append `callback` to the list for `kind`.
    ///
    /// The returned handle removes exactly this callback when unsubscribed or
    /// dropped. Registering the same closure twice yields two independent
    /// subscriptions.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        self.inner.lists().entry(kind).or_default().push(Entry {
            id,
            active: active.clone(),
            callback: Arc::new(callback),
        });
        debug!(event = %kind, subscription = id, "callback registered");

        Subscription {
            kind: Some(kind),
            id,
            active,
            registry: Arc::downgrade(&self.inner),
            detached: false,
        }
    }

    /// Subscribe by wire name. An unknown name is logged and yields an inert
    /// subscription instead of an error.
    pub fn subscribe_named<F>(&self, event_type: &str, callback: F) -> Subscription
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        match EventKind::from_wire(event_type) {
            Some(kind) => self.subscribe(kind, callback),
            None => {
                warn!(event_type, "subscribe called with unknown event type, ignoring");
                Subscription::inert()
            }
        }
    }

    /// Invoke every callback registered for the event's kind.
    ///
    /// A panicking callback is logged and skipped; the remaining callbacks
    /// still run. Returns the number of callbacks that completed.
    pub fn dispatch(&self, event: &StreamEvent) -> usize {
        let kind = event.kind();
        let snapshot: Vec<(u64, Arc<AtomicBool>, Callback)> = match self.inner.lists().get(&kind) {
            Some(list) => list
                .iter()
                .map(|e| (e.id, e.active.clone(), e.callback.clone()))
                .collect(),
            None => return 0,
        };

        let mut completed = 0;
        for (id, active, callback) in snapshot {
            // Unsubscribed earlier in this same pass.
            if !active.load(Ordering::SeqCst) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => {
                    completed += 1;
                    self.inner.metrics.callback_invoked();
                }
                Err(payload) => {
                    self.inner.metrics.subscriber_panic();
                    error!(
                        event = %kind,
                        subscription = id,
                        "subscriber panicked: {}",
                        panic_message(payload.as_ref())
                    );
                }
            }
        }
        completed
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner.lists().get(&kind).map(Vec::len).unwrap_or(0)
    }

    pub fn metrics(&self) -> &Arc<StreamMetrics> {
        &self.inner.metrics
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Handle to one registered callback.
///
/// Dropping the handle unsubscribes; call [`Subscription::detach`] to keep the
/// callback registered for the dispatcher's lifetime instead.
#[must_use = "dropping a Subscription unsubscribes its callback"]
pub struct Subscription {
    kind: Option<EventKind>,
    id: u64,
    active: Arc<AtomicBool>,
    registry: Weak<Registry>,
    detached: bool,
}

impl Subscription {
    fn inert() -> Self {
        Self {
            kind: None,
            id: 0,
            active: Arc::new(AtomicBool::new(false)),
            registry: Weak::new(),
            detached: false,
        }
    }

    pub fn kind(&self) -> Option<EventKind> {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Remove the callback. Calling this more than once has no further effect.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let (Some(kind), Some(registry)) = (self.kind, self.registry.upgrade()) {
            registry.remove(kind, self.id);
            debug!(event = %kind, subscription = self.id, "callback removed");
        }
    }

    /// Leave the callback registered after this handle is dropped.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.detached {
            self.unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventEnvelope, RecordRef, UserId};
    use chrono::Utc;

    fn updated(id: &str) -> StreamEvent {
        StreamEvent::RecordUpdated(EventEnvelope {
            event_type: None,
            record: RecordRef::new(id, "Ana"),
            author_id: UserId::from("U2"),
            author_role: None,
            timestamp: Utc::now(),
        })
    }

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn Fn(&StreamEvent) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let make = move |name: &'static str| {
            let log = log2.clone();
            Box::new(move |_: &StreamEvent| log.lock().unwrap().push(name))
                as Box<dyn Fn(&StreamEvent) + Send + Sync>
        };
        (log, make)
    }

    #[test]
    fn fan_out_in_registration_order() {
        let d = Dispatcher::new();
        let (log, make) = recorder();
        let _a = d.subscribe(EventKind::RecordUpdated, make("A"));
        let _b = d.subscribe(EventKind::RecordUpdated, make("B"));
        let _c = d.subscribe(EventKind::RecordUpdated, make("C"));

        assert_eq!(d.dispatch(&updated("42")), 3);
        assert_eq!(*log.lock().unwrap(), vec!["A", "B", "C"]);
    }

    #[test]
    fn panicking_subscriber_does_not_stop_siblings() {
        let d = Dispatcher::new();
        let (log, make) = recorder();
        let _a = d.subscribe(EventKind::RecordUpdated, make("A"));
        let _b = d.subscribe(EventKind::RecordUpdated, |_| panic!("boom"));
        let _c = d.subscribe(EventKind::RecordUpdated, make("C"));

        assert_eq!(d.dispatch(&updated("42")), 2);
        assert_eq!(*log.lock().unwrap(), vec!["A", "C"]);
        assert_eq!(d.metrics().snapshot().dispatch.subscriber_panics, 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let d = Dispatcher::new();
        let (log, make) = recorder();
        let a = d.subscribe(EventKind::RecordUpdated, make("A"));
        let _b = d.subscribe(EventKind::RecordUpdated, make("B"));

        a.unsubscribe();
        a.unsubscribe();
        assert!(!a.is_active());
        assert_eq!(d.subscriber_count(EventKind::RecordUpdated), 1);

        d.dispatch(&updated("42"));
        d.dispatch(&updated("42"));
        assert_eq!(*log.lock().unwrap(), vec!["B", "B"]);
    }

    #[test]
    fn dropping_handle_unsubscribes() {
        let d = Dispatcher::new();
        {
            let _sub = d.subscribe(EventKind::RecordDeleted, |_| {});
            assert_eq!(d.subscriber_count(EventKind::RecordDeleted), 1);
        }
        assert_eq!(d.subscriber_count(EventKind::RecordDeleted), 0);
    }

    #[test]
    fn detached_subscription_stays_registered() {
        let d = Dispatcher::new();
        d.subscribe(EventKind::Heartbeat, |_| {}).detach();
        assert_eq!(d.subscriber_count(EventKind::Heartbeat), 1);
        assert_eq!(d.dispatch(&StreamEvent::Heartbeat), 1);
    }

    #[test]
    fn kinds_are_isolated() {
        let d = Dispatcher::new();
        let (log, make) = recorder();
        let _u = d.subscribe(EventKind::RecordUpdated, make("updated"));
        let _x = d.subscribe(EventKind::RecordDeleted, make("deleted"));

        d.dispatch(&updated("1"));
        assert_eq!(*log.lock().unwrap(), vec!["updated"]);
    }

    #[test]
    fn unknown_name_yields_inert_subscription() {
        let d = Dispatcher::new();
        let sub = d.subscribe_named("recordUpdatd", |_| {});
        assert!(!sub.is_active());
        assert!(sub.kind().is_none());
        sub.unsubscribe();
        for kind in EventKind::ALL {
            assert_eq!(d.subscriber_count(kind), 0);
        }
    }

    #[test]
    fn self_unsubscribe_mid_dispatch_keeps_siblings() {
        let d = Dispatcher::new();
        let (log, make) = recorder();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let _a = d.subscribe(EventKind::RecordUpdated, make("A"));
        let slot_in = slot.clone();
        let log_b = log.clone();
        let b = d.subscribe(EventKind::RecordUpdated, move |_| {
            log_b.lock().unwrap().push("B");
            if let Some(sub) = slot_in.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(b);
        let _c = d.subscribe(EventKind::RecordUpdated, make("C"));

        d.dispatch(&updated("42"));
        assert_eq!(*log.lock().unwrap(), vec!["A", "B", "C"]);

        d.dispatch(&updated("42"));
        assert_eq!(*log.lock().unwrap(), vec!["A", "B", "C", "A", "C"]);
    }

    #[test]
    fn unsubscribed_mid_pass_sibling_is_not_invoked() {
        let d = Dispatcher::new();
        let (log, make) = recorder();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot_in = slot.clone();
        let _a = d.subscribe(EventKind::RecordUpdated, move |_| {
            if let Some(sub) = slot_in.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        });
        let b = d.subscribe(EventKind::RecordUpdated, make("B"));
        *slot.lock().unwrap() = Some(b);

        d.dispatch(&updated("42"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn subscribe_during_dispatch_of_other_kind() {
        let d = Dispatcher::new();
        let d2 = d.clone();
        let held: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));
        let held_in = held.clone();
        let _s = d.subscribe(EventKind::Connected, move |_| {
            let sub = d2.subscribe(EventKind::RecordCreated, |_| {});
            held_in.lock().unwrap().push(sub);
        });

        d.dispatch(&StreamEvent::Connected(Default::default()));
        assert_eq!(d.subscriber_count(EventKind::RecordCreated), 1);
    }

    #[test]
    fn repeated_mount_unmount_does_not_grow_registry() {
        let d = Dispatcher::new();
        for _ in 0..1000 {
            let _sub = d.subscribe(EventKind::RecordUpdated, |_| {});
        }
        assert_eq!(d.subscriber_count(EventKind::RecordUpdated), 0);
        assert!(d.inner.lists().is_empty());
    }
}
