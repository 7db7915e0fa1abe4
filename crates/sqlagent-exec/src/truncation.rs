//! Shaping of database error text before it is placed in an observation.

/// Longest error message kept in an observation, in characters.
pub const MAX_MESSAGE_CHARS: usize = 300;

/// First non-empty line of a driver message, trimmed.
///
/// Postgres appends `LINE n:` context and a caret marker on following lines;
/// only the headline is useful to the generator.
pub fn first_line(message: &str) -> &str {
    message
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
}

/// Truncate to at most `max_chars` characters, marking the cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}... [truncated]")
}

/// The message stored in an error observation: headline only, bounded length.
pub fn observation_message(raw: &str) -> String {
    truncate_chars(first_line(raw), MAX_MESSAGE_CHARS)
}
