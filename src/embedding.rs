use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use candle_core::{DType, Tensor};

use crate::error::Result;

/// Sentence embedding backend used by the chunked vector engine.
pub trait Embedder {
    /// Identifier of the underlying model, for logs.
    fn model_id(&self) -> &str;

    /// Byte offsets of every token of `text`, without special tokens.
    ///
    /// Chunk windows are cut on these offsets, so they must come from the
    /// same tokenizer that [`embed`](Self::embed) uses.
    fn token_offsets(&self, text: &str) -> Result<Vec<(usize, usize)>>;

    /// Embed each text into one L2-normalized vector.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Mean-pool token states over the attention mask, then L2-normalize.
///
/// `hidden` is `[batch, tokens, dim]`, `attention_mask` is `[batch, tokens]`.
/// Returns `[batch, dim]`.
pub fn masked_mean_l2(hidden: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let mask = attention_mask
        .to_device(hidden.device())?
        .to_dtype(hidden.dtype())?;
    let summed = hidden.broadcast_mul(&mask.unsqueeze(2)?)?.sum(1)?;
    let lengths = mask.sum_keepdim(1)?.clamp(1e-9, f64::MAX)?;
    let mean = summed.broadcast_div(&lengths)?;

    let eps = match hidden.dtype() {
        DType::F16 | DType::BF16 => 1e-6,
        _ => 1e-12,
    };
    let norm = mean.sqr()?.sum_keepdim(1)?.sqrt()?.clamp(eps, f64::MAX)?;
    Ok(mean.broadcast_div(&norm)?)
}

/// Cosine distance in `[0, 2]`; 0 means identical direction.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub const HASHING_DIMENSION: usize = 256;

/// Model-free embedder: hashed bag of lowercase words.
///
/// Tokens are whitespace-separated words. Deterministic across runs, so it
/// is used for offline runs (`STASHBENCH_FAKE_EMBEDDINGS=1`) and in tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(HASHING_DIMENSION)
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn bucket(&self, word: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        word.hash(&mut hasher);
        (hasher.finish() % self.dimension as u64) as usize
    }

    fn normalize_word(word: &str) -> String {
        word.trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase()
    }
}

impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        "hashing"
    }

    fn token_offsets(&self, text: &str) -> Result<Vec<(usize, usize)>> {
        let mut offsets = Vec::new();
        let mut start = None;
        for (i, c) in text.char_indices() {
            match (c.is_whitespace(), start) {
                (true, Some(s)) => {
                    offsets.push((s, i));
                    start = None;
                }
                (false, None) => start = Some(i),
                _ => {}
            }
        }
        if let Some(s) = start {
            offsets.push((s, text.len()));
        }
        Ok(offsets)
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; self.dimension];
                for word in text.split_whitespace() {
                    let word = Self::normalize_word(word);
                    if !word.is_empty() {
                        vector[self.bucket(&word)] += 1.0;
                    }
                }
                let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm > 0.0 {
                    vector.iter_mut().for_each(|v| *v /= norm);
                }
                vector
            })
            .collect())
    }
}
