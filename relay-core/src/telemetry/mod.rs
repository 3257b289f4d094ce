//! Per-response completion records and span attribute keys.
//! Nothing leaves the process until a sink is registered with `set_telemetry_sink`.

pub mod keys;
pub mod types;
#[cfg(test)]
pub mod test_span;

pub use keys::*;
pub use types::*;

use std::sync::Arc;

use once_cell::sync::OnceCell;

/// Receives one `CompletionLog` when a stream or non-stream relay finishes.
///
/// Calls arrive from whichever task ran the relay, usually a tokio worker, and
/// sit on the response path, so keep them short.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record_completion(&self, log: CompletionLog);
}

static TELEMETRY_SINK: OnceCell<Arc<dyn TelemetrySink>> = OnceCell::new();

// Tests run in parallel; only threads that opted in see their own records.
#[cfg(test)]
thread_local! {
    static TEST_CAPTURE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Register the process-wide sink. The first registration wins; later calls
/// return `false` and leave it in place.
pub fn set_telemetry_sink(sink: Arc<dyn TelemetrySink>) -> bool {
    TELEMETRY_SINK.set(sink).is_ok()
}

/// Hand a finished relay's record to the registered sink, if any.
pub(crate) fn emit_completion(log: CompletionLog) {
    #[cfg(test)]
    {
        if !TEST_CAPTURE.with(|c| c.get()) {
            return;
        }
    }
    if let Some(sink) = TELEMETRY_SINK.get() {
        sink.record_completion(log);
    }
}

/// Let the current test thread's relays reach the sink.
#[cfg(test)]
pub fn test_set_capture_enabled(enabled: bool) {
    TEST_CAPTURE.with(|c| c.set(enabled));
}
