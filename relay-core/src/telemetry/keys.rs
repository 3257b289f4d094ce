/// Span/Log attribute keys for relay calls.
/// Keep these stable; changing them is a breaking change for dashboards.
pub const KEY_RELAY_MODE: &str = "relay.mode";
pub const KEY_MODEL: &str = "llm.model";
pub const KEY_STATUS: &str = "http.status";
pub const KEY_EVENTS: &str = "relay.events";

pub const KEY_TOKENS_PROMPT: &str = "tokens.prompt";
pub const KEY_TOKENS_COMPLETION: &str = "tokens.completion";
pub const KEY_TOKENS_TOTAL: &str = "tokens.total";
/// Whether usage was counted locally because the upstream omitted it.
pub const KEY_USAGE_SYNTHESIZED: &str = "tokens.synthesized";

/// Error-related (if applicable)
pub const KEY_ERROR_KIND: &str = "error.kind";
