//! Presentation helpers for PTY output chunks.

/// Appended when a chunk is cut down to the display limit.
pub const TRUNCATION_MARKER: &str = "\n... [OUTPUT TRUNCATED]";

/// Decode a raw read. Invalid UTF-8 (including sequences split across
/// reads) becomes U+FFFD rather than an error.
pub fn decode_chunk(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

/// Cap `text` at `limit` characters, appending [`TRUNCATION_MARKER`] when
/// anything was cut. Text at or under the limit is returned unchanged.
pub fn truncate_for_display(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        None => text.to_string(),
        Some((cut, _)) => {
            let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
            out.push_str(&text[..cut]);
            out.push_str(TRUNCATION_MARKER);
            out
        }
    }
}

/// Best-effort prompt detection: the chunk, trimmed, ends with `:`.
///
/// This is a guess, not proof the child is blocked on a read. `Password:`
/// matches; `Continue? [y/N]` does not; a log line ending in `:` is a
/// false positive.
pub fn looks_like_prompt(text: &str) -> bool {
    text.trim().ends_with(':')
}
