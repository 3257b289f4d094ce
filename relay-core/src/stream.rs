//! Event-stream relay.
//!
//! Contract:
//! - A producer task reads the upstream body line by line, forwards every accepted
//!   record through a bounded channel and accumulates the response text.
//! - The forwarder (the caller's task) pushes records to the client in arrival
//!   order until the producer's one-shot completion signal fires.
//! - Records queued before completion are always delivered first.
//! - The upstream body is closed exactly once, by the producer.

use futures_util::StreamExt;
use http::StatusCode;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use crate::error::ErrorWithStatus;
use crate::model::{RelayMode, StreamDelta};
use crate::sink::EventSink;
use crate::telemetry::{self, CompletionLog};
use crate::upstream::{LineStream, UpstreamBody};

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_SENTINEL: &str = "[DONE]";
/// `data: [DONE]`, the exact form the client receives for the final record.
pub const DATA_DONE: &str = "data: [DONE]";

/// Default number of records buffered between producer and forwarder.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// What a finished stream relay hands back to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOutput {
    /// Concatenation of every decoded delta, in arrival order.
    pub text: String,
    /// Records pushed to the client.
    pub events: u64,
}

/// Whether a raw line is an event record (as opposed to a keepalive or comment).
pub fn is_event_record(line: &str) -> bool {
    line.len() >= DATA_PREFIX.len()
        && (line.starts_with(DATA_PREFIX) || line.starts_with(DONE_SENTINEL))
}

/// Normalize a record for the client: anything after `data: [DONE]` is cut off
/// and one trailing `\r` is removed.
pub fn client_record(line: &str) -> &str {
    let line = if line.starts_with(DATA_DONE) {
        &line[..DATA_DONE.len()]
    } else {
        line
    };
    line.strip_suffix('\r').unwrap_or(line)
}

/// JSON payload of a record, or `None` for the end-of-stream marker.
/// A line starting with `[DONE]` is the marker even when JSON follows it, so it
/// is never decoded.
fn record_payload(line: &str) -> Option<&str> {
    if line.starts_with(DONE_SENTINEL) {
        return None;
    }
    let payload = &line[DATA_PREFIX.len()..];
    (!payload.starts_with(DONE_SENTINEL)).then_some(payload)
}

/// Relay an upstream event stream to `sink` and return the reconstructed text.
pub async fn relay_stream<S>(
    sink: &mut S,
    body: UpstreamBody,
    mode: RelayMode,
) -> Result<StreamOutput, ErrorWithStatus>
where
    S: EventSink + ?Sized,
{
    relay_stream_with_capacity(sink, body, mode, DEFAULT_CHANNEL_CAPACITY).await
}

/// Same as [`relay_stream`] with an explicit hand-off buffer size (minimum 1).
pub async fn relay_stream_with_capacity<S>(
    sink: &mut S,
    body: UpstreamBody,
    mode: RelayMode,
    capacity: usize,
) -> Result<StreamOutput, ErrorWithStatus>
where
    S: EventSink + ?Sized,
{
    let span = tracing::info_span!(
        "relay.stream",
        relay.mode = mode.as_str(),
        relay.events = tracing::field::Empty,
        error.kind = tracing::field::Empty,
    );

    async move {
        let (data_tx, data_rx) = mpsc::channel::<String>(capacity.max(1));
        let (done_tx, done_rx) = oneshot::channel::<()>();

        let producer = tokio::spawn(produce(body, mode, data_tx, done_tx).in_current_span());
        let events = forward(sink, data_rx, done_rx).await;
        tracing::Span::current().record("relay.events", events);
        tracing::debug!(events, "stream forwarding finished");

        let result = match producer.await {
            Ok((text, Ok(()))) => Ok(StreamOutput { text, events }),
            Ok((_, Err(e))) => Err(ErrorWithStatus::wrap(
                e,
                "close_response_body_failed",
                StatusCode::INTERNAL_SERVER_ERROR,
            )),
            Err(join) => Err(ErrorWithStatus::wrap(
                join,
                "stream_producer_failed",
                StatusCode::INTERNAL_SERVER_ERROR,
            )),
        };

        let mut log = CompletionLog::new().mode(mode).stream(true).events(events);
        match &result {
            Ok(out) => log = log.status(StatusCode::OK.as_u16()).text_len(out.text.len()),
            Err(e) => {
                tracing::Span::current().record("error.kind", e.kind().as_str());
                log = log.error(e);
            }
        }
        telemetry::emit_completion(log);
        result
    }
    .instrument(span)
    .await
}

/// Producer: owns the body. Returns the transcript and the result of closing the body.
async fn produce(
    body: UpstreamBody,
    mode: RelayMode,
    data_tx: mpsc::Sender<String>,
    done_tx: oneshot::Sender<()>,
) -> (String, std::io::Result<()>) {
    let mut text = String::new();
    let mut lines = LineStream::new(body);

    while let Some(next) = lines.next().await {
        let line = match next {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "upstream read failed, ending stream");
                break;
            }
        };
        if !is_event_record(&line) {
            continue;
        }

        let payload = record_payload(&line).map(str::to_owned);
        if data_tx.send(line).await.is_err() {
            tracing::debug!("forwarder gone, stopping upstream read");
            break;
        }

        let Some(payload) = payload else { continue };
        match StreamDelta::decode(mode, &payload) {
            Ok(delta) => delta.append_text(&mut text),
            Err(e) => tracing::warn!(error = %e, "skipping undecodable stream event"),
        }
    }

    // Completion is signaled only after the last send above has been queued.
    let _ = done_tx.send(());
    drop(data_tx);

    let closed = lines.into_inner().close();
    (text, closed)
}

/// Forwarder: pushes queued records until the completion signal. Returns the number sent.
async fn forward<S>(
    sink: &mut S,
    mut data_rx: mpsc::Receiver<String>,
    mut done_rx: oneshot::Receiver<()>,
) -> u64
where
    S: EventSink + ?Sized,
{
    sink.set_event_stream_headers();
    let mut sent = 0u64;

    loop {
        tokio::select! {
            biased;
            Some(line) = data_rx.recv() => {
                if let Err(e) = sink.send_event(client_record(&line)).await {
                    tracing::warn!(error = %e, "client push failed, stopping stream");
                    break;
                }
                sent += 1;
            }
            _ = &mut done_rx => break,
        }
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        headers_set: bool,
        events: Vec<String>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        fn set_event_stream_headers(&mut self) {
            self.headers_set = true;
        }

        async fn send_event(&mut self, data: &str) -> io::Result<()> {
            if self.fail_after.is_some_and(|n| self.events.len() >= n) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
            }
            self.events.push(data.to_string());
            Ok(())
        }
    }

    fn body_of(lines: &[&str]) -> UpstreamBody {
        let mut raw = lines.join("\n");
        raw.push('\n');
        UpstreamBody::from_bytes(raw)
    }

    fn chat(content: &str) -> String {
        format!(r#"data: {{"choices":[{{"delta":{{"content":"{content}"}}}}]}}"#)
    }

    #[tokio::test]
    async fn chat_stream_transcript_and_events() {
        let lines = [
            chat("Hi"),
            chat(" there"),
            "data: [DONE]".to_string(),
        ];
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let mut sink = RecordingSink::default();

        let out = relay_stream(&mut sink, body_of(&refs), RelayMode::ChatCompletions)
            .await
            .expect("relay ok");

        assert!(sink.headers_set);
        assert_eq!(out.text, "Hi there");
        assert_eq!(out.events, 3);
        assert_eq!(sink.events.len(), 3);
        assert_eq!(sink.events[0], lines[0]);
        assert_eq!(sink.events[2], "data: [DONE]");
    }

    #[tokio::test]
    async fn short_and_foreign_lines_are_dropped() {
        let mut sink = RecordingSink::default();
        let body = body_of(&[
            ":)",
            "",
            ": keepalive comment",
            "event: message",
            chat("x").as_str(),
            "[DONE]",
        ]);

        let out = relay_stream(&mut sink, body, RelayMode::ChatCompletions).await.unwrap();

        assert_eq!(sink.events, vec![chat("x"), "[DONE]".to_string()]);
        assert_eq!(out.text, "x");
    }

    #[tokio::test]
    async fn malformed_event_is_skipped() {
        let mut sink = RecordingSink::default();
        let body = body_of(&[
            chat("a").as_str(),
            "data: {not json",
            chat("b").as_str(),
            "data: [DONE]",
        ]);

        let out = relay_stream(&mut sink, body, RelayMode::ChatCompletions).await.unwrap();

        assert_eq!(out.text, "ab");
        // The malformed record is still forwarded verbatim.
        assert_eq!(sink.events.len(), 4);
        assert_eq!(sink.events[1], "data: {not json");
    }

    #[tokio::test]
    async fn completions_mode_reads_text() {
        let mut sink = RecordingSink::default();
        let body = body_of(&[
            r#"data: {"choices":[{"text":"foo"}]}"#,
            r#"data: {"choices":[{"text":"bar"},{"text":"baz"}]}"#,
            "data: [DONE]",
        ]);

        let out = relay_stream(&mut sink, body, RelayMode::Completions).await.unwrap();
        assert_eq!(out.text, "foobarbaz");
    }

    #[tokio::test]
    async fn done_is_truncated_and_cr_stripped() {
        let mut sink = RecordingSink::default();
        let raw = format!("{}\r\ndata: [DONE] extra\r\n", chat("z"));

        relay_stream(&mut sink, UpstreamBody::from_bytes(raw), RelayMode::ChatCompletions)
            .await
            .unwrap();

        assert_eq!(sink.events, vec![chat("z"), "data: [DONE]".to_string()]);
    }

    #[test]
    fn client_record_rules() {
        assert_eq!(client_record("data: [DONE]"), "data: [DONE]");
        assert_eq!(client_record(client_record("data: [DONE]")), "data: [DONE]");
        assert_eq!(client_record("data: [DONE]\r"), "data: [DONE]");
        assert_eq!(client_record("data: {}\r"), "data: {}");
        assert_eq!(client_record("data: {}\r\r"), "data: {}\r");
    }

    #[test]
    fn event_record_filter() {
        assert!(!is_event_record(":)"));
        assert!(!is_event_record("data:"));
        assert!(is_event_record("data: "));
        assert!(is_event_record("[DONE]"));
        assert!(!is_event_record("id: 12345"));
    }

    #[tokio::test]
    async fn partial_tail_is_a_record() {
        let mut sink = RecordingSink::default();
        let raw = format!("{}\n{}", chat("a"), chat("b"));

        let out = relay_stream(&mut sink, UpstreamBody::from_bytes(raw), RelayMode::ChatCompletions)
            .await
            .unwrap();
        assert_eq!(out.text, "ab");
        assert_eq!(sink.events.len(), 2);
    }

    #[tokio::test]
    async fn order_preserved_with_tiny_channel() {
        let lines: Vec<String> = (0..200).map(|i| chat(&i.to_string())).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let mut sink = RecordingSink::default();

        let out =
            relay_stream_with_capacity(&mut sink, body_of(&refs), RelayMode::ChatCompletions, 1)
                .await
                .unwrap();

        assert_eq!(sink.events, lines);
        let expected: String = (0..200).map(|i| i.to_string()).collect();
        assert_eq!(out.text, expected);
    }

    #[tokio::test]
    async fn read_error_ends_stream_and_closes_body() {
        let closes = Arc::new(AtomicUsize::new(0));
        let c = closes.clone();
        let items: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from(format!("{}\n", chat("ok")))),
            Err(io::Error::other("connection reset")),
        ];
        let body =
            UpstreamBody::from_stream(futures_util::stream::iter(items)).with_close_hook(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        let mut sink = RecordingSink::default();

        let out = relay_stream(&mut sink, body, RelayMode::ChatCompletions).await.unwrap();
        assert_eq!(out.text, "ok");
        assert_eq!(sink.events.len(), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn read_error_keeps_partial_last_record() {
        let items: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from(format!("{}\n{}", chat("a"), chat("b")))),
            Err(io::Error::other("connection reset")),
        ];
        let body = UpstreamBody::from_stream(futures_util::stream::iter(items));
        let mut sink = RecordingSink::default();

        let out = relay_stream(&mut sink, body, RelayMode::ChatCompletions).await.unwrap();
        assert_eq!(out.text, "ab");
        assert_eq!(out.events, 2);
        assert_eq!(sink.events, vec![chat("a"), chat("b")]);
    }

    #[tokio::test]
    async fn done_prefixed_records_are_never_decoded() {
        let json = r#"{"choices":[{"delta":{"content":"x"}}]}"#;
        let bare = format!("[DONE]{json}");
        let data = format!("data: [DONE]{json}");
        let mut sink = RecordingSink::default();

        let body = body_of(&[bare.as_str(), data.as_str()]);
        let out = relay_stream(&mut sink, body, RelayMode::ChatCompletions)
            .await
            .unwrap();
        assert!(out.text.is_empty());
        assert_eq!(sink.events, vec![bare, DATA_DONE.to_string()]);
    }

    #[tokio::test]
    async fn close_failure_is_reported() {
        let body = body_of(&[chat("a").as_str(), "data: [DONE]"])
            .with_close_hook(|| Err(io::Error::other("close failed")));
        let mut sink = RecordingSink::default();

        let err = relay_stream(&mut sink, body, RelayMode::ChatCompletions).await.unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.kind(), "close_response_body_failed");
        // Already-forwarded records stay delivered.
        assert_eq!(sink.events.len(), 2);
    }

    #[tokio::test]
    async fn client_disconnect_stops_forwarding_and_closes_body() {
        let closes = Arc::new(AtomicUsize::new(0));
        let c = closes.clone();
        let lines: Vec<String> = (0..50).map(|i| chat(&i.to_string())).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let body = body_of(&refs).with_close_hook(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let mut sink = RecordingSink { fail_after: Some(2), ..Default::default() };

        let out = relay_stream_with_capacity(&mut sink, body, RelayMode::ChatCompletions, 1)
            .await
            .unwrap();
        assert_eq!(sink.events.len(), 2);
        assert_eq!(out.events, 2);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_failure_marks_span() {
        let (store, _guard) = crate::telemetry::test_span::install_capture();
        let body =
            body_of(&["data: [DONE]"]).with_close_hook(|| Err(io::Error::other("close failed")));
        let mut sink = RecordingSink::default();

        let _ = relay_stream(&mut sink, body, RelayMode::ChatCompletions).await;

        let fields = store.fields_of("relay.stream").expect("span captured");
        assert_eq!(
            fields.get(telemetry::KEY_ERROR_KIND).map(String::as_str),
            Some("close_response_body_failed")
        );
    }

    #[tokio::test]
    async fn span_records_event_count() {
        let (store, _guard) = crate::telemetry::test_span::install_capture();
        let mut sink = RecordingSink::default();

        let body = body_of(&[chat("a").as_str(), "data: [DONE]"]);
        relay_stream(&mut sink, body, RelayMode::ChatCompletions)
            .await
            .unwrap();

        let fields = store.fields_of("relay.stream").expect("span captured");
        assert_eq!(
            fields.get(telemetry::KEY_RELAY_MODE).map(String::as_str),
            Some("chat_completions")
        );
        assert_eq!(fields.get(telemetry::KEY_EVENTS).map(String::as_str), Some("2"));
    }
}
