//! Content shaping: boundary-aware truncation, paragraph dedup, token
//! estimation.

use std::collections::HashSet;

use md5::{Digest, Md5};

/// Rough token estimate used for response budgeting (≈4 chars per token).
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Truncate at the last sentence boundary at or before `max` characters.
/// Falls back to a word boundary, then a hard char-boundary cut.
#[must_use]
pub fn truncate_at_sentence(text: &str, max: usize) -> (String, bool) {
    if text.len() <= max {
        return (text.to_owned(), false);
    }

    let mut end = max.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let window = &text[..end];

    let sentence_end = [". ", "! ", "? ", ".\n", "!\n", "?\n"]
        .iter()
        .filter_map(|sep| window.rfind(sep).map(|i| i + 1))
        .max();

    let cut = sentence_end
        .filter(|&i| i > max / 2)
        .or_else(|| window.rfind(' ').filter(|&i| i > max / 2))
        .unwrap_or(end);

    (window[..cut].trim_end().to_owned(), true)
}

/// Truncate at the last blank-line paragraph boundary at or before `max`,
/// falling back to a sentence boundary.
#[must_use]
pub fn truncate_at_paragraph(text: &str, max: usize) -> (String, bool) {
    if text.len() <= max {
        return (text.to_owned(), false);
    }

    let mut end = max.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let window = &text[..end];

    match window.rfind("\n\n").filter(|&i| i > max / 2) {
        Some(i) => (window[..i].trim_end().to_owned(), true),
        None => truncate_at_sentence(text, max),
    }
}

/// Hash of a paragraph, insensitive to case, whitespace, and punctuation so
/// near-identical boilerplate collapses onto one hash.
#[must_use]
pub fn paragraph_hash(paragraph: &str) -> String {
    let normalized: String = paragraph
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();

    let mut hasher = Md5::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Minimum paragraph size considered for dedup; shorter fragments (headings,
/// nav items) are kept as-is.
const DEDUP_MIN_CHARS: usize = 80;

/// Drop paragraphs whose hash was already seen, keeping first occurrences.
/// `seen` carries hashes across sources so cross-source duplicates collapse.
#[must_use]
pub fn dedupe_paragraphs(text: &str, seen: &mut HashSet<String>) -> String {
    let mut kept = Vec::new();
    for paragraph in text.split("\n\n") {
        let trimmed = paragraph.trim();
        if trimmed.len() >= DEDUP_MIN_CHARS {
            let hash = paragraph_hash(trimmed);
            if !seen.insert(hash) {
                continue;
            }
        }
        if !trimmed.is_empty() {
            kept.push(trimmed);
        }
    }
    kept.join("\n\n")
}
