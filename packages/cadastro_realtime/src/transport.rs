//! The network seam under [`StreamClient`](crate::StreamClient).
//!
//! A [`Transport`] opens one event stream and yields decoded items until the
//! server closes it or the connection fails. Reconnection is not the
//! transport's concern.

use futures::channel::mpsc;
use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use reqwest::Url;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::sse::{self, MAX_LINE_BYTES, SseItem};

pub type FrameStream = BoxStream<'static, Result<SseItem, TransportError>>;

pub trait Transport: Send + Sync + 'static {
    /// Open the stream at `url`. Resolves once response headers arrive.
    fn open(&self, url: &str) -> BoxFuture<'static, Result<FrameStream, TransportError>>;
}

/// `text/event-stream` over HTTP via reqwest.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        // No overall request timeout: the response body is meant to stay open.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                warn!("failed to build tuned HTTP client, using defaults: {}", e);
                reqwest::Client::new()
            });
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Transport for HttpTransport {
    fn open(&self, url: &str) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let request = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");

        Box::pin(async move {
            let response = request.send().await?;
            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
            {
                return Err(TransportError::Unauthorized {
                    status: status.as_u16(),
                });
            }
            if !status.is_success() {
                return Err(TransportError::Status {
                    status: status.as_u16(),
                });
            }

            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if !content_type.starts_with("text/event-stream") {
                warn!(content_type, "event stream served with unexpected content type");
            }
            debug!(status = status.as_u16(), "event stream response received");

            Ok(frame_items(response.bytes_stream().map(|chunk| {
                chunk.map_err(|e| TransportError::Stream(e.to_string()))
            })))
        })
    }
}

/// Decoded frames interleaved with [`SseItem::Traffic`] markers, one per
/// chunk read off the body. The result ends when the body does.
pub fn frame_items<S, B>(bytes: S) -> FrameStream
where
    S: Stream<Item = Result<B, TransportError>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let (mut traffic_tx, traffic_rx) = mpsc::channel(1);
    let bytes = bytes.inspect(move |_| {
        // A full channel already holds an unread marker.
        let _ = traffic_tx.try_send(());
    });
    let frames = sse::decode(bytes, MAX_LINE_BYTES)
        .map(|item| Some(item.map(SseItem::Frame)))
        .chain(stream::once(future::ready(None)));
    let traffic = traffic_rx.map(|()| Some(Ok(SseItem::Traffic)));

    stream::select(frames, traffic)
        .take_while(|item| future::ready(item.is_some()))
        .filter_map(future::ready)
        .boxed()
}

/// `<events_url>?token=<token>`, with the token percent-encoded.
pub fn stream_url(events_url: &str, token: &str) -> Result<String, TransportError> {
    let mut url =
        Url::parse(events_url).map_err(|e| TransportError::InvalidUrl(format!("{events_url}: {e}")))?;
    url.query_pairs_mut().append_pair("token", token);
    Ok(url.into())
}

/// The URL with any `token` query value masked, for logging.
pub fn redact_url(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return "<invalid url>".to_string();
    };
    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "token" { "***".to_string() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    if pairs.is_empty() {
        return parsed.into();
    }
    parsed.query_pairs_mut().clear().extend_pairs(pairs);
    parsed.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_percent_encoded() {
        let url = stream_url("http://localhost:3000/api/eventos/sse", "a+b/c=").unwrap();
        assert_eq!(
            url,
            "http://localhost:3000/api/eventos/sse?token=a%2Bb%2Fc%3D"
        );
    }

    #[test]
    fn invalid_base_is_reported() {
        let err = stream_url("not a url", "t").unwrap_err();
        assert_eq!(err.error_code(), "invalid_url");
    }

    #[test]
    fn redaction_masks_token_only() {
        let url = stream_url("http://h/api/eventos/sse?x=1", "secret").unwrap();
        let redacted = redact_url(&url);
        assert!(!redacted.contains("secret"));
        assert!(redacted.contains("x=1"));
        assert!(redacted.contains("token=***") || redacted.contains("token=%2A%2A%2A"));
    }

    #[test]
    fn keepalive_comments_surface_as_traffic() {
        let chunks: Vec<Result<&'static [u8], TransportError>> = vec![
            Ok(b": keep-alive\n\n".as_slice()),
            Ok(b"event: heartbeat\ndata: x\n\n".as_slice()),
        ];
        let items: Vec<_> = futures::executor::block_on(frame_items(stream::iter(chunks)).collect());

        assert!(items.contains(&Ok(SseItem::Traffic)));
        let frames: Vec<_> = items
            .iter()
            .filter_map(|i| match i {
                Ok(SseItem::Frame(f)) => Some(f.event.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(frames, vec!["heartbeat"]);
    }

    #[test]
    fn body_errors_reach_the_client() {
        let chunks: Vec<Result<&'static [u8], TransportError>> =
            vec![Ok(b"data: a\n\n".as_slice()), Err(TransportError::Stream("reset".into()))];
        let items: Vec<_> = futures::executor::block_on(frame_items(stream::iter(chunks)).collect());
        assert!(items.contains(&Err(TransportError::Stream("reset".into()))));
    }
}
