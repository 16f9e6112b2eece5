// ABOUTME: Utility functions for content hashing and display formatting
// ABOUTME: Provides stable media filenames and human-readable sizes

use sha2::{Digest, Sha256};

/// First 8 hex chars of the SHA-256 of `data`. Identical bytes always map to
/// the same name, which is what deduplicates inline images across notes.
pub fn short_hash(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest
        .iter()
        .take(4)
        .map(|b| format!("{:02x}", b))
        .collect()
}

pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }

    let truncated: String = s.chars().take(max_chars).collect();
    format!("{}...", truncated)
}

pub fn format_size(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / 1024.0 / 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_hash_stable() {
        assert_eq!(short_hash(b"hello"), short_hash(b"hello"));
        assert_ne!(short_hash(b"hello"), short_hash(b"world"));
        assert_eq!(short_hash(b"hello").len(), 8);
    }

    #[test]
    fn test_short_hash_is_lower_hex() {
        assert!(short_hash(b"x")
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_truncate_str_short() {
        assert_eq!(truncate_str("hello", 100), "hello");
    }

    #[test]
    fn test_truncate_str_long() {
        let result = truncate_str("hello world", 7);
        assert!(result.starts_with("hello"));
        assert!(result.ends_with("..."));
    }

    #[test]
    fn test_truncate_str_utf8() {
        // the limit is characters, not bytes: 3 chars fit in a budget of 5
        // even though they span 9 bytes
        assert_eq!(truncate_str("日本語", 5), "日本語");
        assert_eq!(truncate_str("日本語です", 3), "日本語...");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0.00 MB");
        assert_eq!(format_size(1024 * 1024), "1.00 MB");
        assert_eq!(format_size(1024 * 1024 * 3 / 2), "1.50 MB");
    }
}
