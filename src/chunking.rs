//! Token-bounded chunking for documents that do not fit the embedding
//! model's context window.
//!
//! Chunk sizes are measured in tokens of the embedding model's own
//! tokenizer, not characters. The caller supplies the byte offsets of each
//! token in the text (as produced by the tokenizer) and gets back windows of
//! at most `max_tokens` tokens, with `overlap` tokens shared between
//! neighbouring windows.

/// Default window size. Sentence-transformer MiniLM models are trained
/// with 256-token sequences.
pub const DEFAULT_MAX_TOKENS: usize = 256;

/// Default overlap between neighbouring windows, in tokens.
pub const DEFAULT_OVERLAP: usize = 32;

/// How far a window end may move back to avoid splitting a word.
const WORD_BOUNDARY_LOOKBACK: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Maximum chunk length in tokens.
    pub max_tokens: usize,
    /// Tokens shared between adjacent chunks.
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            overlap: DEFAULT_OVERLAP,
        }
    }
}

/// A window of a document's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    /// The chunk text content.
    pub text: String,
    /// Zero-based chunk index within the document.
    pub index: usize,
    /// Byte offset where this chunk starts in the original document.
    pub start_offset: usize,
    /// Byte offset one past the end of this chunk.
    pub end_offset: usize,
    /// Number of tokens covered.
    pub tokens: usize,
}

/// Split `text` into token-bounded, overlapping spans.
///
/// `offsets` holds the `(start, end)` byte range of every token in `text`,
/// in order. A window that would end inside a word (two tokens with no gap
/// between them) is pulled back to the previous word start when one exists
/// within a short lookback.
///
/// # Examples
///
/// ```
/// use stashbench::chunking::{ChunkingConfig, chunk_by_tokens};
///
/// let text = "one two three four five";
/// let offsets = [(0, 3), (4, 7), (8, 13), (14, 18), (19, 23)];
/// let config = ChunkingConfig { max_tokens: 3, overlap: 1 };
///
/// let spans = chunk_by_tokens(text, &offsets, config);
/// assert_eq!(spans.len(), 2);
/// assert_eq!(spans[0].text, "one two three");
/// assert_eq!(spans[1].text, "three four five");
/// ```
pub fn chunk_by_tokens(
    text: &str,
    offsets: &[(usize, usize)],
    config: ChunkingConfig,
) -> Vec<TextSpan> {
    let max_tokens = config.max_tokens.max(1);
    let overlap = config.overlap.min(max_tokens - 1);
    let count = offsets.len();

    let mut spans = Vec::new();
    let mut start = 0;

    while start < count {
        let mut end = (start + max_tokens).min(count);
        if end < count {
            end = word_boundary_before(offsets, start, end);
        }

        let start_byte = offsets[start].0;
        let end_byte = offsets[end - 1].1;
        if let Some(slice) = text.get(start_byte..end_byte)
            && !slice.trim().is_empty()
        {
            spans.push(TextSpan {
                text: slice.to_string(),
                index: spans.len(),
                start_offset: start_byte,
                end_offset: end_byte,
                tokens: end - start,
            });
        }

        if end >= count {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }

    spans
}

/// Move `end` back to the first token of a word, if the token at `end`
/// continues the word of the token before it.
fn word_boundary_before(
    offsets: &[(usize, usize)],
    start: usize,
    end: usize,
) -> usize {
    let continues_word = |i: usize| offsets[i].0 <= offsets[i - 1].1;
    if !continues_word(end) {
        return end;
    }

    let floor = end.saturating_sub(WORD_BOUNDARY_LOOKBACK).max(start + 1);
    (floor..end)
        .rev()
        .find(|&i| !continues_word(i))
        .unwrap_or(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whitespace_offsets(text: &str) -> Vec<(usize, usize)> {
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
        offsets
    }

    #[test]
    fn short_text_is_single_chunk() {
        let text = "Hello, world!";
        let spans = chunk_by_tokens(
            text,
            &whitespace_offsets(text),
            ChunkingConfig::default(),
        );
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, text);
        assert_eq!(spans[0].start_offset, 0);
        assert_eq!(spans[0].end_offset, text.len());
    }

    #[test]
    fn empty_text_has_no_chunks() {
        let spans = chunk_by_tokens("", &[], ChunkingConfig::default());
        assert!(spans.is_empty());
    }

    #[test]
    fn windows_never_exceed_max_tokens() {
        let text = "word ".repeat(100);
        let config = ChunkingConfig {
            max_tokens: 10,
            overlap: 3,
        };
        let spans = chunk_by_tokens(&text, &whitespace_offsets(&text), config);

        assert!(spans.len() > 1);
        for span in &spans {
            assert!(span.tokens <= 10);
            assert_eq!(span.text.split_whitespace().count(), span.tokens);
        }
        assert_eq!(spans.last().unwrap().end_offset, text.trim_end().len());
    }

    #[test]
    fn neighbouring_windows_overlap() {
        let text = (0..20).map(|i| format!("w{i}")).collect::<Vec<_>>();
        let text = text.join(" ");
        let config = ChunkingConfig {
            max_tokens: 8,
            overlap: 2,
        };
        let spans = chunk_by_tokens(&text, &whitespace_offsets(&text), config);

        assert!(spans[0].text.ends_with("w6 w7"));
        assert!(spans[1].text.starts_with("w6 w7"));
        for (i, span) in spans.iter().enumerate() {
            assert_eq!(span.index, i);
        }
    }

    #[test]
    fn overlap_larger_than_window_still_advances() {
        let text = "a b c d e f";
        let config = ChunkingConfig {
            max_tokens: 2,
            overlap: 5,
        };
        let spans = chunk_by_tokens(text, &whitespace_offsets(text), config);
        assert_eq!(spans.len(), 5);
        assert_eq!(spans.last().unwrap().text, "e f");
    }

    #[test]
    fn avoids_splitting_subword_tokens() {
        // "unbelievable" split into three sub-word tokens.
        let text = "it was unbelievable fun";
        let offsets = [(0, 2), (3, 6), (7, 9), (9, 14), (14, 19), (20, 23)];
        let config = ChunkingConfig {
            max_tokens: 4,
            overlap: 0,
        };
        let spans = chunk_by_tokens(text, &offsets, config);

        assert_eq!(spans[0].text, "it was");
        assert_eq!(spans[1].text, "unbelievable fun");
    }

    #[test]
    fn handles_multibyte_text() {
        let text = "héllo wörld ünïcode ✓ done";
        let config = ChunkingConfig {
            max_tokens: 2,
            overlap: 0,
        };
        let spans = chunk_by_tokens(text, &whitespace_offsets(text), config);
        let joined: Vec<_> = spans.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(joined, vec!["héllo wörld", "ünïcode ✓", "done"]);
    }
}
