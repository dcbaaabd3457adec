//! Word-boundary text chunker.
//!
//! Splits extracted document text into chunks of at most `max_chars`
//! characters, breaking only between whitespace-separated words. Runs of
//! whitespace (newlines included) collapse to a single space. A single word
//! longer than the limit becomes a chunk on its own rather than being cut.

/// Split text into ordered chunks on word boundaries.
///
/// Returns an empty vector for blank input.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        let would_be = if current.is_empty() {
            word_len
        } else {
            current_len + 1 + word_len
        };

        if would_be > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if !current.is_empty() {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(word);
        current_len += word_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", 500);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_blank_text() {
        assert!(chunk_text("", 500).is_empty());
        assert!(chunk_text("  \n\t ", 500).is_empty());
    }

    #[test]
    fn test_never_splits_words() {
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        let chunks = chunk_text(text, 12);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.chars().count() <= 12, "chunk too long: {:?}", c);
        }
        assert_eq!(chunks.join(" "), text);
    }

    #[test]
    fn test_long_word_gets_own_chunk() {
        let chunks = chunk_text("a supercalifragilistic b", 5);
        assert_eq!(chunks, vec!["a", "supercalifragilistic", "b"]);
    }

    #[test]
    fn test_exact_fit() {
        let chunks = chunk_text("abc def", 7);
        assert_eq!(chunks, vec!["abc def"]);
        let chunks = chunk_text("abc defg", 7);
        assert_eq!(chunks, vec!["abc", "defg"]);
    }

    #[test]
    fn test_counts_chars_not_bytes() {
        let chunks = chunk_text("héllo wörld", 11);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_deterministic() {
        let text = "The sky is blue. Water boils at 100C. Grass is green.";
        assert_eq!(chunk_text(text, 20), chunk_text(text, 20));
    }
}
