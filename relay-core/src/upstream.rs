//! Upstream response handle and newline framing over its body.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use http::{HeaderMap, StatusCode};

/// Boxed byte stream of an upstream body.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

type CloseHook = Box<dyn FnOnce() -> io::Result<()> + Send>;

/// Owned upstream body. Released when closed or dropped, whichever comes first.
pub struct UpstreamBody {
    inner: ByteStream,
    on_close: Option<CloseHook>,
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamBody").finish_non_exhaustive()
    }
}

impl UpstreamBody {
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: Box::pin(stream),
            on_close: None,
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self::from_stream(futures_util::stream::once(async move { Ok(bytes) }))
    }

    /// Run `hook` when the body is closed. Its error is what `close` reports.
    pub fn with_close_hook<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> io::Result<()> + Send + 'static,
    {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        self.inner.next().await
    }

    /// Read everything that is left.
    pub async fn read_to_end(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    /// Release the underlying connection. Consumes the handle so it can only happen once.
    pub fn close(mut self) -> io::Result<()> {
        let hook = self.on_close.take();
        drop(self);
        match hook {
            Some(hook) => hook(),
            None => Ok(()),
        }
    }
}

/// One upstream HTTP response: status, headers and the not-yet-read body.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: UpstreamBody) -> Self {
        Self { status, headers, body }
    }

    pub fn from_reqwest(resp: reqwest::Response) -> Self {
        let status = resp.status();
        let headers = resp.headers().clone();
        let stream = resp.bytes_stream().map(|r| r.map_err(io::Error::other));
        Self::new(status, headers, UpstreamBody::from_stream(stream))
    }
}

/// Splits a body into lines on `\n`. The newline is removed but a preceding `\r`
/// is kept. A non-empty tail without a newline is yielded at end of stream,
/// and ahead of a read error, which then ends the stream.
pub struct LineStream {
    inner: UpstreamBody,
    buf: Vec<u8>,
    done: bool,
    failed: Option<io::Error>,
}

impl LineStream {
    pub fn new(inner: UpstreamBody) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            done: false,
            failed: None,
        }
    }

    /// Give the body back, dropping any buffered partial line.
    pub fn into_inner(self) -> UpstreamBody {
        self.inner
    }

    fn take_line(&mut self) -> Option<String> {
        let idx = self.buf.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=idx).collect();
        line.pop();
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn take_tail(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&tail).into_owned())
    }
}

impl Stream for LineStream {
    type Item = io::Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(line) = self.take_line() {
                return Poll::Ready(Some(Ok(line)));
            }
            if self.done {
                return Poll::Ready(self.failed.take().map(Err));
            }

            match self.inner.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.buf.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    match self.take_tail() {
                        Some(tail) => {
                            self.failed = Some(e);
                            return Poll::Ready(Some(Ok(tail)));
                        }
                        None => return Poll::Ready(Some(Err(e))),
                    }
                }
                Poll::Ready(None) => {
                    self.done = true;
                    return Poll::Ready(self.take_tail().map(Ok));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
