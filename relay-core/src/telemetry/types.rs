use serde::Serialize;

use crate::model::{RelayMode, Usage};

/// Structured completion event emitted once per relayed response.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompletionLog {
    pub mode: Option<RelayMode>,
    pub model: Option<String>,
    pub stream: bool,
    pub status: Option<u16>,
    /// Records pushed to the client (stream relay only).
    pub events: Option<u64>,
    pub text_len: Option<usize>,

    pub tokens_prompt: Option<u32>,
    pub tokens_completion: Option<u32>,
    pub tokens_total: Option<u32>,
    pub usage_synthesized: bool,

    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl CompletionLog {
    pub fn new() -> Self { Self::default() }
    pub fn mode(mut self, v: RelayMode) -> Self { self.mode = Some(v); self }
    pub fn model(mut self, v: &str) -> Self { self.model = Some(v.to_string()); self }
    pub fn stream(mut self, v: bool) -> Self { self.stream = v; self }
    pub fn status(mut self, v: u16) -> Self { self.status = Some(v); self }
    pub fn events(mut self, v: u64) -> Self { self.events = Some(v); self }
    pub fn text_len(mut self, v: usize) -> Self { self.text_len = Some(v); self }
    pub fn usage(mut self, u: &Usage, synthesized: bool) -> Self {
        self.tokens_prompt = Some(u.prompt_tokens);
        self.tokens_completion = Some(u.completion_tokens);
        self.tokens_total = Some(u.total_tokens);
        self.usage_synthesized = synthesized;
        self
    }
    pub fn error(mut self, e: &crate::error::ErrorWithStatus) -> Self {
        self.status = Some(e.status.as_u16());
        self.error_kind = Some(e.kind());
        self.error_message = Some(e.error.message.clone());
        self
    }
}
