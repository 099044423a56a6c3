//! `text/event-stream` decoding.
//!
//! Parsing is done by `eventsource-stream`; this module turns its events into
//! [`SseFrame`]s and caps how many bytes a single line may buffer.

use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use crate::error::TransportError;

/// Longest line the decoder will buffer while waiting for its terminator.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// One dispatched event block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name; `message` when the block had no `event:` field.
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub data: String,
    /// Last event id seen on the stream at dispatch time.
    pub id: Option<String>,
    /// Reconnection time requested by the server, in milliseconds.
    pub retry: Option<u64>,
}

impl From<Event> for SseFrame {
    fn from(event: Event) -> Self {
        Self {
            event: if event.event.is_empty() {
                "message".to_string()
            } else {
                event.event
            },
            data: event.data,
            id: Some(event.id).filter(|id| !id.is_empty()),
            retry: event.retry.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

/// What a transport stream yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseItem {
    Frame(SseFrame),
    /// Bytes arrived on the connection, whether or not they completed a
    /// frame. Keepalive comments only ever show up as this.
    Traffic,
}

/// Tracks the length of the unterminated line at the end of the input.
#[derive(Debug)]
pub struct LineLimit {
    pending: usize,
    max: usize,
}

impl LineLimit {
    pub fn new(max: usize) -> Self {
        Self { pending: 0, max }
    }

    /// Account for `chunk`, failing once any line grows past the limit.
    pub fn check(&mut self, chunk: &[u8]) -> Result<(), TransportError> {
        for byte in chunk {
            if *byte == b'\n' || *byte == b'\r' {
                self.pending = 0;
            } else {
                self.pending += 1;
                if self.pending > self.max {
                    return Err(TransportError::LineTooLong { limit: self.max });
                }
            }
        }
        Ok(())
    }
}

/// Decode a body of byte chunks into frames.
///
/// Errors from `bytes` pass through unchanged; a malformed stream or an
/// over-long line surfaces as an error item, after which the caller should
/// drop the stream.
pub fn decode<S, B>(bytes: S, max_line: usize) -> BoxStream<'static, Result<SseFrame, TransportError>>
where
    S: Stream<Item = Result<B, TransportError>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let mut limit = LineLimit::new(max_line);
    bytes
        .map(move |chunk| chunk.and_then(|b| limit.check(b.as_ref()).map(|()| b)))
        .eventsource()
        .map(|item| match item {
            Ok(event) => Ok(SseFrame::from(event)),
            Err(EventStreamError::Transport(e)) => Err(e),
            Err(e) => Err(TransportError::Stream(e.to_string())),
        })
        .boxed()
}
