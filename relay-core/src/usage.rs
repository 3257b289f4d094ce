//! Usage accounting: token counting and the fallback for upstreams that omit usage.

use tiktoken_rs::{CoreBPE, tokenizer};

use crate::model::Usage;

/// Estimates how many tokens `text` costs under `model`. Must be deterministic per model.
pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str, model: &str) -> u32;
}

impl<F> TokenCounter for F
where
    F: Fn(&str, &str) -> u32 + Send + Sync,
{
    fn count_text(&self, text: &str, model: &str) -> u32 {
        self(text, model)
    }
}

/// Counts with the BPE tiktoken associates with the model name; unknown models use `cl100k_base`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TiktokenCounter;

impl TiktokenCounter {
    /// Tokenizers are lazily built on first use; call this outside the request path.
    pub fn preload() {
        let _ = tiktoken_rs::cl100k_base_singleton();
        let _ = tiktoken_rs::o200k_base_singleton();
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_text(&self, text: &str, model: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        let n = bpe_for_model(model).encode_with_special_tokens(text).len();
        u32::try_from(n).unwrap_or(u32::MAX)
    }
}

fn bpe_for_model(model: &str) -> &'static CoreBPE {
    let tokenizer = tokenizer::get_tokenizer(model).unwrap_or(tokenizer::Tokenizer::Cl100kBase);
    match tokenizer {
        tokenizer::Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase => tiktoken_rs::r50k_base_singleton(),
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        tokenizer::Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
    }
}

/// Keep the upstream record when it reports a non-zero total; otherwise count the
/// completion locally and pair it with the caller's prompt count.
pub fn resolve_usage(
    upstream: Option<Usage>,
    response_text: &str,
    prompt_tokens: u32,
    model: &str,
    counter: &dyn TokenCounter,
) -> Usage {
    match upstream {
        Some(u) if u.total_tokens != 0 => u,
        _ => Usage::new(prompt_tokens, counter.count_text(response_text, model)),
    }
}
