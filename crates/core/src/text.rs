//! Text helpers for diagnostic strings stored alongside snapshots and queue entries.

/// Maximum length (in characters) of a normalized error message.
pub const MAX_ERROR_CHARS: usize = 500;

const ELLIPSIS: &str = "...";

/// Truncate to at most `max_chars` characters, respecting UTF-8 boundaries.
pub fn truncate_chars(input: &str, max_chars: usize) -> &str {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => &input[..idx],
        None => input,
    }
}

/// Collapse whitespace runs (including newlines) to single spaces and cap the
/// result at [`MAX_ERROR_CHARS`] characters.
///
/// Leading and trailing whitespace is dropped rather than collapsed, so
/// `"  lead\n trail  "` becomes `"lead trail"`.
///
/// Truncated output is exactly `MAX_ERROR_CHARS` characters and ends in `...`.
pub fn normalize_error_for_log(message: &str) -> String {
    let collapsed = message.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= MAX_ERROR_CHARS {
        return collapsed;
    }

    let keep = MAX_ERROR_CHARS - ELLIPSIS.len();
    let mut out = truncate_chars(&collapsed, keep).to_string();
    out.push_str(ELLIPSIS);
    out
}
