// Token counting module
//
// The default strategy counts characters: an explicit approximation, not a
// real tokenizer. It is behind a trait so a real tokenizer can be substituted
// without touching the decoder or orchestrator contracts.

use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

/// Strategy for estimating the token count of response content.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u64;
}

/// Character-count approximation. This is the default used by probe
/// classification; results are labelled as approximate.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharCountEstimator;

impl TokenEstimator for CharCountEstimator {
    fn estimate(&self, text: &str) -> u64 {
        text.chars().count() as u64
    }
}

/// Global tiktoken encoding (lazily initialized)
static ENCODING: OnceLock<CoreBPE> = OnceLock::new();

fn get_encoding() -> &'static CoreBPE {
    ENCODING.get_or_init(|| {
        tiktoken_rs::cl100k_base().expect("Failed to initialize cl100k_base encoding")
    })
}

/// Real tokenizer backed by tiktoken (cl100k_base), for callers that want
/// actual token counts instead of the character approximation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TiktokenEstimator;

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        get_encoding().encode_with_special_tokens(text).len() as u64
    }
}
