//! Text chunkers used by the built-in splitter stages.
//!
//! Two strategies:
//!
//! - [`paragraph_chunks`] packs `\n\n`-separated paragraphs into chunks of
//!   at most `max_tokens` (≈ 4 chars per token), hard-splitting oversized
//!   paragraphs at the last newline or space.
//! - [`window_chunks`] slides a fixed window of `units` words with
//!   `overlap` words shared between neighbours.
//!
//! Both always return at least one chunk and number chunks `0..N`.
//!
//! ```rust
//! use ingest_relay_core::chunk::paragraph_chunks;
//!
//! let chunks = paragraph_chunks("Hello world.\n\nSecond paragraph.", 700);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].index, 0);
//! ```

use sha2::{Digest, Sha256};

use crate::models::TextChunk;

/// Rough characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

impl TextChunk {
    /// Build a chunk and hash its text.
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        let text = text.into();
        let hash = format!("{:x}", Sha256::digest(text.as_bytes()));
        Self { index, text, hash }
    }
}

/// Pack paragraphs into chunks bounded by `max_tokens`.
pub fn paragraph_chunks(text: &str, max_tokens: usize) -> Vec<TextChunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let joined_len = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };
        if joined_len > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }

        if para.len() > max_chars {
            pieces.extend(hard_split(para, max_chars));
            continue;
        }
        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
    }
    if !buf.is_empty() {
        pieces.push(buf);
    }
    if pieces.is_empty() {
        pieces.push(text.trim().to_string());
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(i, p)| TextChunk::new(i, p))
        .collect()
}

/// Cut one oversized paragraph, preferring newline then space boundaries.
fn hard_split(para: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = para;
    while !rest.is_empty() {
        let mut cut = floor_char_boundary(rest, max_chars);
        if cut < rest.len() {
            if let Some(pos) = rest[..cut].rfind('\n').or_else(|| rest[..cut].rfind(' ')) {
                if pos > 0 {
                    cut = pos + 1;
                }
            }
        }
        if cut == 0 {
            // Single character wider than the budget.
            cut = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }
        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        rest = &rest[cut..];
    }
    out
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Fixed word windows of `units` words, consecutive windows sharing
/// `overlap` words. An overlap of `units` or more is clamped to
/// `units - 1` so the window always advances.
pub fn window_chunks(text: &str, units: usize, overlap: usize) -> Vec<TextChunk> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if units == 0 || words.len() <= units {
        return vec![TextChunk::new(0, words.join(" "))];
    }
    let step = units - overlap.min(units - 1);

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + units).min(words.len());
        chunks.push(TextChunk::new(chunks.len(), words[start..end].join(" ")));
        if end == words.len() {
            break;
        }
        start += step;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_single_chunk() {
        let chunks = paragraph_chunks("", 700);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "");
        assert_eq!(window_chunks("   ", 10, 2).len(), 1);
    }

    #[test]
    fn test_paragraphs_packed_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = paragraph_chunks(text, 700);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.starts_with("First"));
        assert!(chunks[0].text.ends_with("Third paragraph."));
    }

    #[test]
    fn test_paragraphs_split_when_over_limit() {
        let text = (0..40)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = paragraph_chunks(&text, 10);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
            assert!(c.text.len() <= 40, "chunk {} too long", i);
        }
    }

    #[test]
    fn test_oversized_paragraph_hard_split_on_multibyte() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let chunks = paragraph_chunks(text, 3);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| !c.text.is_empty()));
    }

    #[test]
    fn test_hash_is_sha256_of_text() {
        let c = TextChunk::new(0, "abc");
        assert_eq!(
            c.hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_window_overlap() {
        let text = "a b c d e f g h i j";
        let chunks = window_chunks(text, 4, 1);
        let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["a b c d", "d e f g", "g h i j"]);
    }

    #[test]
    fn test_window_overlap_clamped() {
        let chunks = window_chunks("a b c d e", 2, 5);
        let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["a b", "b c", "c d", "d e"]);
    }
}
