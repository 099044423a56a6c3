//! In-memory transport for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::sse::SseItem;
use crate::transport::{FrameStream, Transport};

/// What the next `open` call does.
pub enum Step {
    /// Open, yield the items, then stay open until dropped.
    Hold(Vec<SseItem>),
    /// Open, yield the items, then end the stream.
    CloseAfter(Vec<SseItem>),
    Fail(TransportError),
}

impl Step {
    pub fn hold(items: Vec<SseItem>) -> Self {
        Self::Hold(items)
    }

    pub fn close_after(items: Vec<SseItem>) -> Self {
        Self::CloseAfter(items)
    }

    pub fn fail() -> Self {
        Self::Fail(TransportError::Request("connection refused".to_string()))
    }

    pub fn unauthorized() -> Self {
        Self::Fail(TransportError::Unauthorized { status: 401 })
    }
}

#[derive(Default)]
struct Script {
    steps: Mutex<VecDeque<Step>>,
    urls: Mutex<Vec<String>>,
    open_times: Mutex<Vec<Instant>>,
    live: AtomicUsize,
    max_live: AtomicUsize,
}

/// Replays a queue of [`Step`]s. Once the queue is empty every open fails.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    script: Arc<Script>,
}

struct LiveGuard(Arc<Script>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, step: Step) {
        self.script.steps.lock().unwrap().push_back(step);
    }

    pub fn opens(&self) -> usize {
        self.script.urls.lock().unwrap().len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.script.urls.lock().unwrap().clone()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.script.open_times.lock().unwrap().clone()
    }

    /// Streams handed out and not yet dropped.
    pub fn live(&self) -> usize {
        self.script.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.script.max_live.load(Ordering::SeqCst)
    }

    fn tracked(&self, items: Vec<SseItem>, hold: bool) -> FrameStream {
        let now = self.script.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.max_live.fetch_max(now, Ordering::SeqCst);
        let guard = LiveGuard(self.script.clone());

        let head = stream::iter(items.into_iter().map(Ok));
        let body = if hold {
            head.chain(stream::pending()).boxed()
        } else {
            head.boxed()
        };
        body.map(move |item| {
            let _ = &guard;
            item
        })
        .boxed()
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        self.script.urls.lock().unwrap().push(url.to_string());
        self.script.open_times.lock().unwrap().push(Instant::now());
        let step = self
            .script
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(Step::fail);

        let result = match step {
            Step::Hold(items) => Ok(self.tracked(items, true)),
            Step::CloseAfter(items) => Ok(self.tracked(items, false)),
            Step::Fail(e) => Err(e),
        };
        Box::pin(async move { result })
    }
}
