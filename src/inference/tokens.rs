//! Token estimation for backends that don't report usage.
//!
//! Uses a character-based heuristic calibrated for LLM tokenizers. Local
//! prediction is an opaque text-in/text-out call, so its usage counts are
//! estimated with this instead of reported by the model.

/// Average characters per token for English prose and code.
///
/// Most tokenizers produce ~3.5-4.0 chars/token; this overestimates.
const CHARS_PER_TOKEN: f64 = 3.2;

/// Estimate the token count for a piece of text.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as f64;
    (chars / CHARS_PER_TOKEN).ceil() as u32
}

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        // 13 chars → ceil(13 / 3.2) = 5
        assert_eq!(estimate_tokens("Hello, world!"), 5);
    }

    #[test]
    fn test_truncate_utf8_on_boundary() {
        let s = "héllo";
        // 'é' is two bytes at 1..3; cutting at 2 must back off to 1.
        assert_eq!(truncate_utf8(s, 2), "h");
        assert_eq!(truncate_utf8(s, 100), s);
    }
}
