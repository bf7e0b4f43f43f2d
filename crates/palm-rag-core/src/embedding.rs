//! Embedding provider trait, input preparation, and vector utilities.
//!
//! Hosted providers (OpenAI) implement [`EmbeddingProvider`] in the
//! application crate. Before text reaches a provider it goes through
//! [`prepare_input`]: whitespace is collapsed and the text is cut to a
//! token budget estimated at [`CHARS_PER_TOKEN`] characters per token.
//! There is no exact tokenization and no built-in retry; a failed call is
//! a [`PalmError::Provider`] and the caller decides what to do about it.

use async_trait::async_trait;

use crate::chunk::snap_to_char_boundary;
use crate::error::{PalmError, Result};

/// Approximate characters-per-token ratio used for every budget in the
/// pipeline (chunking, embedding input, context assembly).
pub const CHARS_PER_TOKEN: usize = 4;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PalmError::Provider("empty embedding response".to_string()))
    }
}

/// Estimated token count (`ceil(len / 4)`).
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Collapse every run of whitespace into a single space and trim.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize `text` and truncate it to at most `max_tokens × 4` bytes,
/// cutting on a char boundary.
pub fn prepare_input(text: &str, max_tokens: usize) -> String {
    let mut normalized = normalize_whitespace(text);
    let max_chars = max_tokens * CHARS_PER_TOKEN;
    if normalized.len() > max_chars {
        let cut = snap_to_char_boundary(&normalized, max_chars);
        normalized.truncate(cut);
    }
    normalized
}

/// Encode a float vector as little-endian `f32` bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(
            normalize_whitespace("  the \n\n reef\twalk  "),
            "the reef walk"
        );
        assert_eq!(normalize_whitespace(""), "");
    }

    #[test]
    fn test_prepare_input_truncates_to_budget() {
        let text = "word ".repeat(100);
        let prepared = prepare_input(&text, 10);
        assert_eq!(prepared.len(), 40);
        assert!(prepared.starts_with("word word"));
    }

    #[test]
    fn test_prepare_input_multibyte_boundary() {
        let text = "é".repeat(30);
        let prepared = prepare_input(&text, 3);
        assert!(prepared.len() <= 12);
        assert!(prepared.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
