//! Realtime layer for the beneficiary registry.
//!
//! Keeps one server-sent event stream open per authenticated session, fans
//! decoded record events out to subscribers, and lets edit views notice when
//! their record was changed or deleted by someone else.
//!
//! # Example
//!
//! ```no_run
//! use cadastro_realtime::{
//!     ConflictDetector, RealtimeConfig, RecordId, RecordView, Resource, Session, StreamProvider,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RealtimeConfig::default();
//!     let provider = StreamProvider::new(&config);
//!     provider.start(Session::new("7", "token")).await;
//!
//!     let view = RecordView {
//!         resource: Resource::Pessoas,
//!         id: RecordId::from("42"),
//!         data: serde_json::json!({"id": "42", "nome": "Ana"}),
//!     };
//!     let detector = ConflictDetector::open(provider.dispatcher(), view, "7", 5, || {
//!         println!("record deleted, closing");
//!     });
//!
//!     let mut changes = detector.watch();
//!     while changes.changed().await.is_ok() {
//!         println!("{:?}", *changes.borrow());
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod conflict;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod live_list;
pub mod metrics;
pub mod provider;
pub mod records;
pub mod sse;
pub mod transport;

#[cfg(test)]
mod testing;

pub use client::{ConnectionState, ConnectionStatus, Session, StreamClient};
pub use config::{RealtimeConfig, ReconnectPolicy};
pub use conflict::{ConflictDetector, ConflictKind, ConflictState, ConflictTracker, RecordView, ViewPhase};
pub use dispatcher::{Dispatcher, Subscription};
pub use error::{FrameError, RecordError, TransportError};
pub use event::{EventEnvelope, EventKind, RecordId, RecordRef, StreamEvent, UserId};
pub use live_list::LiveRecordList;
pub use metrics::{MetricsSnapshot, StreamMetrics};
pub use provider::StreamProvider;
pub use records::{RecordClient, RecordSource, Resource};
pub use transport::{HttpTransport, Transport};
