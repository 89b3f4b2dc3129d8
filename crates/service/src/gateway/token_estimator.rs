use std::sync::OnceLock;
use tiktoken_rs::tokenizer::{get_tokenizer, Tokenizer};
use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};

static CL100K: OnceLock<Option<CoreBPE>> = OnceLock::new();
static O200K: OnceLock<Option<CoreBPE>> = OnceLock::new();

/// Token counting seam used for input estimates and completion fallbacks.
pub(crate) trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str, model: &str) -> usize;
}

/// BPE counter keyed by the model's tokenizer; unknown models use `cl100k_base`.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TiktokenCounter;

fn bpe_for_model(model: &str) -> Option<&'static CoreBPE> {
    match get_tokenizer(model.trim()) {
        Some(Tokenizer::O200kBase) => O200K
            .get_or_init(|| o200k_base().ok())
            .as_ref()
            .or_else(|| cl100k()),
        _ => cl100k(),
    }
}

fn cl100k() -> Option<&'static CoreBPE> {
    CL100K.get_or_init(|| cl100k_base().ok()).as_ref()
}

impl TokenCounter for TiktokenCounter {
    fn count_text(&self, text: &str, model: &str) -> usize {
        if text.trim().is_empty() {
            return 0;
        }
        match bpe_for_model(model) {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            // 中文注释：词表加载失败时按 4 字节/词粗估，保证计费兜底不为 0。
            None => text.len().div_ceil(4),
        }
    }
}

pub(crate) fn default_counter() -> &'static TiktokenCounter {
    static COUNTER: TiktokenCounter = TiktokenCounter;
    &COUNTER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_text_counts_zero() {
        assert_eq!(TiktokenCounter.count_text("", "gpt-4"), 0);
        assert_eq!(TiktokenCounter.count_text("  \n", "gpt-4"), 0);
    }

    #[test]
    fn known_and_unknown_models_both_count() {
        assert_eq!(TiktokenCounter.count_text("hello world", "gpt-4"), 2);
        assert_eq!(
            TiktokenCounter.count_text("hello world", "some-private-model"),
            2
        );
    }
}
