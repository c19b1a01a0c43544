//! Input sanitization collaborator.
//!
//! The engine never sends raw user input to the backend; a sanitizer sits
//! in front of every outbound message. The trait fails closed: on any
//! internal doubt the output is stripped down, never passed through.

use regex::Regex;

/// Sanitizes raw user input before it enters a request body.
pub trait InputSanitizer: Send + Sync {
    /// Produce a safe version of `raw`. Must fail closed: an empty or
    /// stripped result is always acceptable, unescaped passthrough is not.
    fn sanitize(&self, raw: &str) -> String;
}

/// Conservative default sanitizer.
///
/// Strips angle-bracket markup and control characters, trims, and caps
/// the length. Not a substitute for backend-side validation; it keeps
/// obviously hostile or accidental markup out of the wire body.
pub struct DefaultSanitizer {
    markup: Regex,
    max_len: usize,
}

impl DefaultSanitizer {
    /// Create a sanitizer with the given output length cap.
    pub fn new(max_len: usize) -> Self {
        Self {
            markup: Regex::new(r"<[^>]*>?").unwrap(),
            max_len,
        }
    }
}

impl Default for DefaultSanitizer {
    fn default() -> Self {
        Self::new(4000)
    }
}

impl InputSanitizer for DefaultSanitizer {
    fn sanitize(&self, raw: &str) -> String {
        let stripped = self.markup.replace_all(raw, "");
        let cleaned: String = stripped
            .chars()
            .filter(|c| !c.is_control() || *c == '\n')
            .collect();
        let trimmed = cleaned.trim();

        let mut out = String::with_capacity(trimmed.len().min(self.max_len));
        for (i, c) in trimmed.chars().enumerate() {
            if i >= self.max_len {
                break;
            }
            out.push(c);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markup_and_trims() {
        let sanitizer = DefaultSanitizer::default();
        assert_eq!(
            sanitizer.sanitize("  <script>alert(1)</script>hello  "),
            "alert(1)hello"
        );
        assert_eq!(sanitizer.sanitize("<b>bold</b> text"), "bold text");
    }

    #[test]
    fn strips_unterminated_tags() {
        let sanitizer = DefaultSanitizer::default();
        assert_eq!(sanitizer.sanitize("hi <img src=x onerror="), "hi");
    }

    #[test]
    fn removes_control_characters_but_keeps_newlines() {
        let sanitizer = DefaultSanitizer::default();
        assert_eq!(sanitizer.sanitize("a\u{0}b\nc"), "ab\nc");
    }

    #[test]
    fn caps_the_length() {
        let sanitizer = DefaultSanitizer::new(5);
        assert_eq!(sanitizer.sanitize("abcdefghij"), "abcde");
    }

    #[test]
    fn empty_input_stays_empty() {
        let sanitizer = DefaultSanitizer::default();
        assert_eq!(sanitizer.sanitize("   "), "");
    }
}
