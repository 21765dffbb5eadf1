//! Session title derivation helpers.

use std::sync::LazyLock;

use regex::Regex;

use crate::store::types::DEFAULT_SESSION_TITLE;

/// Instruction sent with the first user message to obtain a title.
pub const TITLE_SYSTEM_PROMPT: &str = "Write a very short title (3-6 words) for a chat that starts with the following message. Reply with the title only, without quotes or trailing punctuation.";

/// Maximum title length in characters.
pub const MAX_TITLE_CHARS: usize = 50;

/// Maximum seed length forwarded to the provider, in characters.
pub const MAX_SEED_CHARS: usize = 500;

static WHITESPACE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\s+").ok());

/// Title used whenever derivation fails.
#[must_use]
pub const fn fallback_title() -> &'static str {
    DEFAULT_SESSION_TITLE
}

/// Trim the seed text forwarded for title derivation.
#[must_use]
pub fn seed_excerpt(seed: &str) -> String {
    seed.chars().take(MAX_SEED_CHARS).collect()
}

/// Normalise raw model output into a display title.
///
/// Strips surrounding quotes and markdown emphasis, collapses whitespace and
/// caps the length. Returns `None` when nothing usable remains.
#[must_use]
pub fn clean_title(raw: &str) -> Option<String> {
    let first_line = raw.trim().lines().next().unwrap_or_default();
    let stripped = first_line
        .trim()
        .trim_start_matches("Title:")
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '*' | '#' | '`'))
        .trim_end_matches(['.', '!', ':'])
        .trim();

    let collapsed = match WHITESPACE.as_ref() {
        Some(re) => re.replace_all(stripped, " ").into_owned(),
        None => stripped.to_string(),
    };

    let title: String = collapsed.chars().take(MAX_TITLE_CHARS).collect();
    let title = title.trim().to_string();
    if title.is_empty() { None } else { Some(title) }
}
