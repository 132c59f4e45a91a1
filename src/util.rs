//! Shared utility functions

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    now_ms() / 1000
}

/// Encode a number in base36 (lowercase), as used in forward `saveId`s.
///
/// A saveId has the form `<nodeName>-<nowMs base36>` so the receiving
/// cluster can correlate frames from one forward operation.
pub fn base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ASCII")
}

/// Sanitize a comma-delimited tag list to the allowed alphabet
/// `[-a-zA-Z0-9_:,]`, dropping empty entries.
pub fn sanitize_tags(tags: &str) -> Vec<String> {
    tags.split(',')
        .map(|t| {
            t.chars()
                .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
                .collect::<String>()
        })
        .filter(|t| !t.is_empty())
        .collect()
}

/// Safely truncate a string to at most `max_bytes` while respecting UTF-8 boundaries.
///
/// If the string is already shorter than `max_bytes`, returns it unchanged.
/// Otherwise, finds the last valid UTF-8 character boundary at or before `max_bytes`
/// and returns a slice up to that point.
pub fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
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
    fn test_base36_zero() {
        assert_eq!(base36(0), "0");
    }

    #[test]
    fn test_base36_round_values() {
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
    }

    #[test]
    fn test_base36_matches_known_encoding() {
        // 1700000000000 ms == "loyw3v28" in lowercase base36
        assert_eq!(base36(1_700_000_000_000), "loyw3v28");
    }

    #[test]
    fn test_sanitize_tags_strips_disallowed() {
        assert_eq!(
            sanitize_tags("cron1, cron 2,bad!tag"),
            vec!["cron1", "cron2", "badtag"]
        );
    }

    #[test]
    fn test_sanitize_tags_keeps_allowed_punctuation() {
        assert_eq!(
            sanitize_tags("proto:http,x-y_z"),
            vec!["proto:http", "x-y_z"]
        );
    }

    #[test]
    fn test_sanitize_tags_drops_empty_entries() {
        assert_eq!(sanitize_tags(",,a,"), vec!["a"]);
    }

    #[test]
    fn test_truncate_at_ascii_boundary() {
        assert_eq!(truncate_utf8_safe("hello world", 5), "hello");
    }

    #[test]
    fn test_truncate_at_utf8_boundary() {
        let s = "日本語";
        assert_eq!(truncate_utf8_safe(s, 4), "日");
        assert_eq!(truncate_utf8_safe(s, 6), "日本");
    }
}
