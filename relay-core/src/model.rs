use serde::{Deserialize, Serialize};

use crate::error::UpstreamError;

/// Which upstream endpoint a response came from. Selects the stream delta shape.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    ChatCompletions,
    Completions,
}

impl RelayMode {
    /// Map a request path onto a relay mode. Query strings and trailing slashes are ignored.
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split_once('?').map(|(p, _)| p).unwrap_or(path);
        let path = path.strip_suffix('/').unwrap_or(path);
        if path.ends_with("/chat/completions") {
            Some(Self::ChatCompletions)
        } else if path.ends_with("/completions") {
            Some(Self::Completions)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat_completions",
            Self::Completions => "completions",
        }
    }

    /// Upstream path this mode is served from.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::ChatCompletions => "/v1/chat/completions",
            Self::Completions => "/v1/completions",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// A chat message as returned in a non-stream choice. `content` is kept as raw
/// JSON because upstreams return either a string or an array of parts.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Message {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    /// Plain text of the message. Array content contributes its `text` parts in order.
    pub fn string_content(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Array(parts) => parts
                .iter()
                .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect(),
            _ => String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct TextResponseChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub message: Message,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Non-stream response envelope. Only the fields the relay reads are typed.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct TextResponse {
    #[serde(default)]
    pub error: Option<UpstreamError>,
    #[serde(default)]
    pub choices: Vec<TextResponseChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

impl TextResponse {
    /// The upstream-reported error, if its `type` is non-empty.
    pub fn upstream_error(&self) -> Option<&UpstreamError> {
        self.error.as_ref().filter(|e| !e.kind.is_empty())
    }

    /// Text of the last choice; earlier choices are ignored.
    pub fn last_choice_text(&self) -> String {
        self.choices
            .last()
            .map(|c| c.message.string_content())
            .unwrap_or_default()
    }
}

// ---- Stream wire structs ----
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ChatDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ChatStreamChoice {
    #[serde(default)]
    pub delta: ChatDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ChatCompletionsStreamResponse {
    #[serde(default)]
    pub choices: Vec<ChatStreamChoice>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct CompletionStreamChoice {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct CompletionsStreamResponse {
    #[serde(default)]
    pub choices: Vec<CompletionStreamChoice>,
}

/// One decoded stream event, in the shape selected by the call's `RelayMode`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Chat(ChatCompletionsStreamResponse),
    Completion(CompletionsStreamResponse),
}

impl StreamDelta {
    pub fn decode(mode: RelayMode, payload: &str) -> serde_json::Result<Self> {
        match mode {
            RelayMode::ChatCompletions => serde_json::from_str(payload).map(Self::Chat),
            RelayMode::Completions => serde_json::from_str(payload).map(Self::Completion),
        }
    }

    /// Append every choice's fragment, in order.
    pub fn append_text(&self, out: &mut String) {
        match self {
            Self::Chat(r) => r
                .choices
                .iter()
                .filter_map(|c| c.delta.content.as_deref())
                .for_each(|s| out.push_str(s)),
            Self::Completion(r) => r
                .choices
                .iter()
                .filter_map(|c| c.text.as_deref())
                .for_each(|s| out.push_str(s)),
        }
    }
}
