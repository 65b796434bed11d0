use chrono::{DateTime, Local, TimeZone};
use sha2::{Digest, Sha256};

use super::tokenizer::count_tokens;
use crate::constants::{DEFAULT_MAX_FILE_PATH_LENGTH, GRAPH_FIELD_SEP};

fn hex_digest(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// `prefix` followed by the first 32 hex chars of the SHA-256 of `content`.
pub fn compute_id(prefix: &str, content: &str) -> String {
    let hex = hex_digest(content);
    format!("{prefix}{}", &hex[..32])
}

/// Stable cache key over several parts.
pub fn compute_args_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// `{prefix}_{YYYYmmdd_HHMMSS}_{8 hex}`.
pub fn generate_track_id(prefix: &str) -> String {
    let ts = Local::now().format("%Y%m%d_%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{ts}_{}", &suffix[..8])
}

pub fn clean_text(text: &str) -> String {
    text.replace('\0', "").trim().to_string()
}

pub fn split_by_markers<'a>(content: &'a str, markers: &[&str]) -> Vec<&'a str> {
    let mut parts = vec![content];
    for marker in markers {
        parts = parts
            .into_iter()
            .flat_map(|p| p.split(marker))
            .collect();
    }
    parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Split a `<SEP>`-joined field into its distinct parts.
pub fn split_field(value: &str) -> Vec<&str> {
    split_by_markers(value, &[GRAPH_FIELD_SEP])
}

/// Merge separator-joined values, keeping first-seen order and dropping
/// duplicates. The result is capped at the maximum file path length.
pub fn join_unique<'a, I>(existing: &'a str, new: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen: Vec<&str> = Vec::new();
    for part in split_field(existing).into_iter().chain(
        new.into_iter()
            .flat_map(split_field),
    ) {
        if !seen.contains(&part) {
            seen.push(part);
        }
    }
    let mut joined = seen.join(GRAPH_FIELD_SEP);
    if joined.chars().count() > DEFAULT_MAX_FILE_PATH_LENGTH {
        joined = joined.chars().take(DEFAULT_MAX_FILE_PATH_LENGTH).collect();
    }
    joined
}

/// Keep the longest prefix of `items` whose token total stays within `max_tokens`.
pub fn truncate_list_by_tokens<T, F>(items: Vec<T>, key: F, max_tokens: usize) -> Vec<T>
where
    F: Fn(&T) -> String,
{
    let mut total = 0usize;
    let mut kept = Vec::with_capacity(items.len());
    for item in items {
        total += count_tokens(&key(&item));
        if total > max_tokens {
            break;
        }
        kept.push(item);
    }
    kept
}

pub fn format_datetime<Tz: TimeZone>(dt: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    dt.to_rfc3339()
}

pub fn now_rfc3339() -> String {
    format_datetime(&Local::now())
}

/// First `n` characters of `text`.
pub fn summary_of(text: &str, n: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= n {
        trimmed.to_string()
    } else {
        let mut s: String = trimmed.chars().take(n).collect();
        s.push_str("...");
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_id_is_prefixed_and_stable() {
        let a = compute_id("doc-", "hello");
        assert!(a.starts_with("doc-"));
        assert_eq!(a.len(), 4 + 32);
        assert_eq!(a, compute_id("doc-", "hello"));
        assert_ne!(a, compute_id("doc-", "hello!"));
    }

    #[test]
    fn args_hash_separates_parts() {
        assert_ne!(compute_args_hash(&["ab", "c"]), compute_args_hash(&["a", "bc"]));
    }

    #[test]
    fn track_id_format() {
        let id = generate_track_id("upload");
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "upload");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 8);
    }

    #[test]
    fn clean_text_strips_nul() {
        assert_eq!(clean_text("  a\0b \n"), "ab");
    }

    #[test]
    fn split_by_markers_drops_empty() {
        assert_eq!(
            split_by_markers("a##b<|COMPLETE|>##", &["##", "<|COMPLETE|>"]),
            vec!["a", "b"]
        );
    }

    #[test]
    fn join_unique_preserves_order() {
        let joined = join_unique("c1<SEP>c2", ["c2", "c3<SEP>c1"]);
        assert_eq!(joined, "c1<SEP>c2<SEP>c3");
        assert_eq!(join_unique("", ["x"]), "x");
    }

    #[test]
    fn truncate_list_respects_budget() {
        let items = vec!["one two".to_string(), "three four".to_string(), "five".to_string()];
        let kept = truncate_list_by_tokens(items, |s| s.clone(), 4);
        assert_eq!(kept.len(), 2);
        let none = truncate_list_by_tokens(vec!["abc".to_string()], |s| s.clone(), 0);
        assert!(none.is_empty());
    }

    #[test]
    fn summary_truncates_with_ellipsis() {
        assert_eq!(summary_of("short", 100), "short");
        let long = "x".repeat(150);
        let s = summary_of(&long, 100);
        assert_eq!(s.chars().count(), 103);
    }
}
