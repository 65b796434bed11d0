//! Token counting and token-window splitting using tiktoken's `cl100k_base`.
//!
//! When the vocabulary cannot be loaded, counts fall back to a
//! four-characters-per-token estimate and windows are cut on characters.

use std::sync::OnceLock;

use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::error;

const CHARS_PER_TOKEN: usize = 4;

static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn encoder() -> Option<&'static CoreBPE> {
    ENCODER
        .get_or_init(|| match cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(err) => {
                error!("Failed to load cl100k_base tokenizer, using estimates: {err}");
                None
            }
        })
        .as_ref()
}

pub fn count_tokens(text: &str) -> usize {
    match encoder() {
        Some(bpe) => bpe.encode_ordinary(text).len(),
        None => text.chars().count().div_ceil(CHARS_PER_TOKEN),
    }
}

/// Decode a token slice, trimming up to three tokens at either edge when the
/// slice splits a multi-byte character.
fn decode_window(bpe: &CoreBPE, tokens: &[u32]) -> String {
    for trim_end in 0..=3usize.min(tokens.len()) {
        for trim_start in 0..=3usize.min(tokens.len() - trim_end) {
            let window = &tokens[trim_start..tokens.len() - trim_end];
            if let Ok(text) = bpe.decode(window.to_vec()) {
                return text;
            }
        }
    }
    String::new()
}

/// Split text into windows of at most `size` tokens, each starting
/// `size - overlap` tokens after the previous one.
///
/// Returns `(content, token_count)` pairs.
pub fn token_windows(text: &str, size: usize, overlap: usize) -> Vec<(String, usize)> {
    let size = size.max(1);
    let overlap = overlap.min(size - 1);
    let step = size - overlap;

    match encoder() {
        Some(bpe) => {
            let tokens = bpe.encode_ordinary(text);
            let mut windows = Vec::new();
            let mut start = 0;
            while start < tokens.len() {
                let end = (start + size).min(tokens.len());
                windows.push((decode_window(bpe, &tokens[start..end]), end - start));
                if end == tokens.len() {
                    break;
                }
                start += step;
            }
            windows
        }
        None => {
            let chars: Vec<char> = text.chars().collect();
            let (csize, cstep) = (size * CHARS_PER_TOKEN, step * CHARS_PER_TOKEN);
            let mut windows = Vec::new();
            let mut start = 0;
            while start < chars.len() {
                let end = (start + csize).min(chars.len());
                let content: String = chars[start..end].iter().collect();
                let count = count_tokens(&content);
                windows.push((content, count));
                if end == chars.len() {
                    break;
                }
                start += cstep;
            }
            windows
        }
    }
}

/// Keep at most `max_tokens` tokens from the start of `text`.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    match encoder() {
        Some(bpe) => {
            let tokens = bpe.encode_ordinary(text);
            if tokens.len() <= max_tokens {
                text.to_string()
            } else {
                decode_window(bpe, &tokens[..max_tokens])
            }
        }
        None => text.chars().take(max_tokens * CHARS_PER_TOKEN).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_tokens_for_plain_text() {
        assert_eq!(count_tokens(""), 0);
        let n = count_tokens("Knowledge graphs connect entities with relations.");
        assert!(n > 3 && n < 20);
    }

    #[test]
    fn windows_cover_text_with_overlap() {
        let text = (0..300).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let windows = token_windows(&text, 50, 10);
        assert!(windows.len() > 1);
        assert!(windows.iter().all(|(_, n)| *n <= 50));
        assert!(windows[0].0.starts_with("word0"));
        assert!(windows.last().unwrap().0.contains("word299"));
    }

    #[test]
    fn short_text_is_single_window() {
        let windows = token_windows("hello world", 100, 10);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].0, "hello world");
    }

    #[test]
    fn overlap_is_clamped() {
        let windows = token_windows("a b c d e f g h", 2, 10);
        assert!(!windows.is_empty());
    }

    #[test]
    fn truncate_keeps_prefix() {
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        let cut = truncate_to_tokens(text, 3);
        assert!(text.starts_with(cut.trim_end()));
        assert!(count_tokens(&cut) <= 3);
        assert_eq!(truncate_to_tokens("short", 100), "short");
    }

    #[test]
    fn multibyte_text_decodes() {
        let text = "知识图谱连接实体与关系。".repeat(20);
        let windows = token_windows(&text, 7, 2);
        assert!(windows.iter().all(|(content, _)| !content.is_empty()));
    }
}
