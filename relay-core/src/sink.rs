//! Client-facing sinks. The web transport implements these; the relay only pushes.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Push side of an event-stream response.
#[async_trait]
pub trait EventSink: Send {
    /// Called once before the first event.
    fn set_event_stream_headers(&mut self);

    /// Deliver one record. An error means the client is gone and the relay should stop.
    async fn send_event(&mut self, data: &str) -> io::Result<()>;
}

/// Whole-body response writer.
#[async_trait]
pub trait ResponseWriter: Send {
    /// Replaces any value already set under `name`.
    fn set_header(&mut self, name: &HeaderName, value: &HeaderValue);
    fn write_status(&mut self, status: StatusCode);
    async fn write_body(&mut self, body: &[u8]) -> io::Result<()>;
}

/// Headers an event-stream response carries.
pub fn event_stream_headers() -> HeaderMap {
    let mut h = HeaderMap::new();
    h.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    h.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    h.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    h.insert(
        HeaderName::from_static("transfer-encoding"),
        HeaderValue::from_static("chunked"),
    );
    h.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    h
}

/// Wire frame for one record: `data` lines end with a blank line, anything else
/// with a single newline.
pub fn render_event(data: &str) -> String {
    if data.starts_with("data") {
        format!("{data}\n\n")
    } else {
        format!("{data}\n")
    }
}

/// Writes event frames to any async writer, flushing after each one.
pub struct SseWriter<W> {
    inner: W,
    headers: HeaderMap,
}

impl<W> SseWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            headers: HeaderMap::new(),
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> EventSink for SseWriter<W> {
    fn set_event_stream_headers(&mut self) {
        self.headers.extend(event_stream_headers());
    }

    async fn send_event(&mut self, data: &str) -> io::Result<()> {
        self.inner.write_all(render_event(data).as_bytes()).await?;
        self.inner.flush().await
    }
}

/// Pushes rendered frames into a channel, for transports that take a body stream.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
    headers: HeaderMap,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx,
            headers: HeaderMap::new(),
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    fn set_event_stream_headers(&mut self) {
        self.headers.extend(event_stream_headers());
    }

    async fn send_event(&mut self, data: &str) -> io::Result<()> {
        self.tx
            .send(Bytes::from(render_event(data)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))
    }
}

/// Captures a whole response in memory.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    pub status: Option<StatusCode>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[async_trait]
impl ResponseWriter for BufferedResponse {
    fn set_header(&mut self, name: &HeaderName, value: &HeaderValue) {
        self.headers.insert(name.clone(), value.clone());
    }

    fn write_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    async fn write_body(&mut self, body: &[u8]) -> io::Result<()> {
        self.body.extend_from_slice(body);
        Ok(())
    }
}
