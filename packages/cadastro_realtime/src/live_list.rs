//! A collection view kept current from record events.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::debug;

use crate::dispatcher::{Dispatcher, Subscription};
use crate::event::{EventKind, RecordId, RecordRef, StreamEvent};
use crate::records::Resource;

type Filter = Box<dyn Fn(&RecordRef) -> bool + Send + Sync>;

struct ListState {
    records: Vec<RecordRef>,
    version: u64,
}

struct Shared {
    state: Mutex<ListState>,
    resource: Resource,
    filter: Option<Filter>,
    version_tx: watch::Sender<u64>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ListState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// New records must name this list's resource.
    fn accepts(&self, record: &RecordRef) -> bool {
        record.resource() == Some(self.resource) && self.filter.as_ref().is_none_or(|f| f(record))
    }

    fn foreign(&self, record: &RecordRef) -> bool {
        record.resource().is_some_and(|r| r != self.resource)
    }

    fn apply(&self, event: &StreamEvent) {
        if event.envelope().is_some_and(|env| self.foreign(&env.record)) {
            return;
        }

        let mut state = self.state();
        let changed = match event {
            StreamEvent::RecordCreated(env) if self.accepts(&env.record) => {
                upsert(&mut state.records, env.record.clone());
                true
            }
            StreamEvent::RecordUpdated(env) => {
                match state.records.iter_mut().find(|r| r.id == env.record.id) {
                    Some(slot) => {
                        *slot = env.record.clone();
                        true
                    }
                    None => false,
                }
            }
            StreamEvent::RecordDeleted(env) => {
                let before = state.records.len();
                state.records.retain(|r| r.id != env.record.id);
                state.records.len() != before
            }
            _ => false,
        };

        if changed {
            state.version += 1;
            debug!(event = %event.kind(), version = state.version, "live list updated");
            self.version_tx.send_replace(state.version);
        }
    }
}

fn upsert(records: &mut Vec<RecordRef>, record: RecordRef) {
    match records.iter_mut().find(|r| r.id == record.id) {
        Some(slot) => *slot = record,
        None => records.push(record),
    }
}

/// Records of one [`Resource`] shown by a list page.
///
/// Created records are appended (or replace an entry with the same id) when
/// their resource tag matches the list's. Updates replace entries already
/// present and deletions remove them, unless the record is tagged with a
/// different resource. Events for records outside the list are ignored.
pub struct LiveRecordList {
    shared: Arc<Shared>,
    _subscriptions: Vec<Subscription>,
}

impl LiveRecordList {
    pub fn open(dispatcher: &Dispatcher, resource: Resource, initial: Vec<RecordRef>) -> Self {
        Self::build(dispatcher, resource, initial, None)
    }

    /// Like [`open`](Self::open), but created records only join the list when
    /// `filter` also accepts them.
    pub fn with_filter<F>(
        dispatcher: &Dispatcher,
        resource: Resource,
        initial: Vec<RecordRef>,
        filter: F,
    ) -> Self
    where
        F: Fn(&RecordRef) -> bool + Send + Sync + 'static,
    {
        Self::build(dispatcher, resource, initial, Some(Box::new(filter)))
    }

    fn build(
        dispatcher: &Dispatcher,
        resource: Resource,
        initial: Vec<RecordRef>,
        filter: Option<Filter>,
    ) -> Self {
        let (version_tx, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            state: Mutex::new(ListState {
                records: initial,
                version: 0,
            }),
            resource,
            filter,
            version_tx,
        });

        let subscriptions = [
            EventKind::RecordCreated,
            EventKind::RecordUpdated,
            EventKind::RecordDeleted,
        ]
        .into_iter()
        .map(|kind| {
            let weak = Arc::downgrade(&shared);
            dispatcher.subscribe(kind, move |event| {
                if let Some(shared) = weak.upgrade() {
                    shared.apply(event);
                }
            })
        })
        .collect();

        Self {
            shared,
            _subscriptions: subscriptions,
        }
    }

    pub fn resource(&self) -> Resource {
        self.shared.resource
    }

    pub fn records(&self) -> Vec<RecordRef> {
        self.shared.state().records.clone()
    }

    pub fn get(&self, id: &RecordId) -> Option<RecordRef> {
        self.shared.state().records.iter().find(|r| &r.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.shared.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bumped on every change.
    pub fn version(&self) -> u64 {
        self.shared.state().version
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.shared.version_tx.subscribe()
    }

    /// Replace the contents after a full refetch.
    pub fn replace_all(&self, records: Vec<RecordRef>) {
        let mut state = self.shared.state();
        state.records = records;
        state.version += 1;
        self.shared.version_tx.send_replace(state.version);
    }
}
