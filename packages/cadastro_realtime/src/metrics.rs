//! Stream metrics for observability
//!
//! Counters are updated by the client and dispatcher; hosts read them through
//! [`StreamMetrics::snapshot`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct StreamMetrics {
    // Connection metrics
    /// Successful stream opens
    pub connections_opened: AtomicU64,
    /// Reconnect attempts scheduled by the backoff policy
    pub reconnect_attempts: AtomicU64,

    // Frame metrics
    /// Frames decoded from the wire (any name)
    pub frames_received: AtomicU64,
    /// Frames with an unrecognised name
    pub frames_ignored: AtomicU64,
    /// Frames whose payload failed to decode
    pub parse_errors: AtomicU64,
    /// Heartbeat frames
    pub heartbeats: AtomicU64,

    // Dispatch metrics
    /// Callback invocations that completed
    pub callbacks_invoked: AtomicU64,
    /// Callback invocations that panicked
    pub subscriber_panics: AtomicU64,

    start_time: Option<Instant>,
}

impl StreamMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_scheduled(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_ignored(&self) {
        self.frames_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    pub fn callback_invoked(&self) {
        self.callbacks_invoked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_panic(&self) {
        self.subscriber_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                opened: self.connections_opened.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            },
            frames: FrameMetrics {
                received: self.frames_received.load(Ordering::Relaxed),
                ignored: self.frames_ignored.load(Ordering::Relaxed),
                parse_errors: self.parse_errors.load(Ordering::Relaxed),
                heartbeats: self.heartbeats.load(Ordering::Relaxed),
            },
            dispatch: DispatchMetrics {
                callbacks_invoked: self.callbacks_invoked.load(Ordering::Relaxed),
                subscriber_panics: self.subscriber_panics.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub frames: FrameMetrics,
    pub dispatch: DispatchMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub opened: u64,
    pub reconnect_attempts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub received: u64,
    pub ignored: u64,
    pub parse_errors: u64,
    pub heartbeats: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchMetrics {
    pub callbacks_invoked: u64,
    pub subscriber_panics: u64,
}
