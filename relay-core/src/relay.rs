//! Whole-body relay: pass an upstream response through and settle its usage.

use http::StatusCode;
use tracing::Instrument;

use crate::error::ErrorWithStatus;
use crate::model::{RelayMode, TextResponse, Usage};
use crate::sink::ResponseWriter;
use crate::telemetry::{self, CompletionLog};
use crate::upstream::UpstreamResponse;
use crate::usage::{TokenCounter, resolve_usage};

/// Caller-known facts about the request being relayed.
#[derive(Debug, Clone, Copy)]
pub struct RelayRequest<'a> {
    pub mode: RelayMode,
    pub model: &'a str,
    /// Prompt size counted before the upstream call.
    pub prompt_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonStreamOutput {
    pub usage: Usage,
    /// Message text of the last choice.
    pub text: String,
}

/// Relay a complete upstream response to `writer`.
///
/// On an upstream-declared error nothing is written and the error comes back
/// with the upstream's own status code.
pub async fn relay_non_stream<W>(
    writer: &mut W,
    resp: UpstreamResponse,
    req: RelayRequest<'_>,
    counter: &dyn TokenCounter,
) -> Result<NonStreamOutput, ErrorWithStatus>
where
    W: ResponseWriter + ?Sized,
{
    let span = tracing::info_span!(
        "relay.non_stream",
        relay.mode = req.mode.as_str(),
        llm.model = req.model,
        http.status = resp.status.as_u16(),
        tokens.prompt = tracing::field::Empty,
        tokens.completion = tracing::field::Empty,
        tokens.total = tracing::field::Empty,
        tokens.synthesized = tracing::field::Empty,
        error.kind = tracing::field::Empty,
    );

    async move {
        let status = resp.status;
        let result = pass_through(writer, resp, req, counter).await;

        let log = CompletionLog::new().mode(req.mode).model(req.model).stream(false);
        let log = match &result {
            Ok((out, synthesized)) => {
                let span = tracing::Span::current();
                span.record("tokens.prompt", out.usage.prompt_tokens);
                span.record("tokens.completion", out.usage.completion_tokens);
                span.record("tokens.total", out.usage.total_tokens);
                span.record("tokens.synthesized", *synthesized);
                log.status(status.as_u16())
                    .text_len(out.text.len())
                    .usage(&out.usage, *synthesized)
            }
            Err(e) => {
                tracing::Span::current().record("error.kind", e.kind().as_str());
                log.error(e)
            }
        };
        telemetry::emit_completion(log);
        result.map(|(out, _)| out)
    }
    .instrument(span)
    .await
}

async fn pass_through<W>(
    writer: &mut W,
    resp: UpstreamResponse,
    req: RelayRequest<'_>,
    counter: &dyn TokenCounter,
) -> Result<(NonStreamOutput, bool), ErrorWithStatus>
where
    W: ResponseWriter + ?Sized,
{
    let UpstreamResponse { status, headers, mut body } = resp;

    let bytes = match body.read_to_end().await {
        Ok(b) => b,
        Err(e) => {
            // Release the connection; the read failure is what gets reported.
            let _ = body.close();
            return Err(wrap_500(e, "read_response_body_failed"));
        }
    };
    body.close().map_err(|e| wrap_500(e, "close_response_body_failed"))?;

    let envelope: TextResponse =
        serde_json::from_slice(&bytes).map_err(|e| wrap_500(e, "unmarshal_response_body_failed"))?;

    if let Some(err) = envelope.upstream_error() {
        tracing::debug!(error.kind = %err.kind, "upstream reported an error");
        return Err(ErrorWithStatus {
            error: err.clone(),
            status,
        });
    }

    for name in headers.keys() {
        if let Some(value) = headers.get(name) {
            writer.set_header(name, value);
        }
    }
    writer.write_status(status);
    writer
        .write_body(&bytes)
        .await
        .map_err(|e| wrap_500(e, "copy_response_body_failed"))?;

    let text = envelope.last_choice_text();
    let synthesized = envelope.usage.is_none_or(|u| u.total_tokens == 0);
    let usage = resolve_usage(envelope.usage, &text, req.prompt_tokens, req.model, counter);

    Ok((NonStreamOutput { usage, text }, synthesized))
}

fn wrap_500(err: impl std::fmt::Display, code: &str) -> ErrorWithStatus {
    ErrorWithStatus::wrap(err, code, StatusCode::INTERNAL_SERVER_ERROR)
}
