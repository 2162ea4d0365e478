use sha2::{Digest, Sha256};

/// Truncate a string to `max` characters, appending "…" if truncated.
/// Handles multi-byte (CJK) correctly via char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{truncated}…")
    }
}

/// Change detector over (id, content) pairs, order-sensitive. Persisted
/// next to each category summary, so the digest must not change between
/// builds: SHA-256 over length-prefixed fields.
pub fn fingerprint<'a>(rows: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut hasher = Sha256::new();
    let mut count = 0usize;
    for (id, content) in rows {
        for part in [id, content] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        count += 1;
    }
    format!("{count}:{:x}", hasher.finalize())
}

/// Relative age such as "5m ago", "3h ago" or "12d ago". Future timestamps read as "0m ago".
pub fn format_age(ms: i64, now: i64) -> String {
    let age_secs = (now - ms).max(0) / 1000;
    if age_secs < 3600 {
        format!("{}m ago", age_secs / 60)
    } else if age_secs < 86400 {
        format!("{}h ago", age_secs / 3600)
    } else {
        format!("{}d ago", age_secs / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_truncate() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello world", 5), "hello…");
    }

    #[test]
    fn cjk_truncate() {
        assert_eq!(truncate_chars("你好世界测试", 4), "你好世界…");
    }

    #[test]
    fn fingerprint_tracks_changes() {
        let a = fingerprint([("1", "tea"), ("2", "coffee")]);
        assert_eq!(a, fingerprint([("1", "tea"), ("2", "coffee")]));
        assert_ne!(a, fingerprint([("1", "tea")]));
        assert_ne!(a, fingerprint([("1", "tea"), ("2", "cocoa")]));
        assert!(fingerprint([]).starts_with("0:"));
        // no ambiguity between field boundaries
        assert_ne!(fingerprint([("1t", "ea")]), fingerprint([("1", "tea")]));
    }

    #[test]
    fn fingerprint_is_stable() {
        assert_eq!(
            fingerprint([("1", "tea")]),
            "1:6d7655362f5f4a536b5a586605dc1d636a41f219e6a055875bf2fb3fa016fb49"
        );
        assert_eq!(
            fingerprint([]),
            "0:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn ages() {
        let now = 1_000_000_000_000;
        assert_eq!(format_age(now - 90_000, now), "1m ago");
        assert_eq!(format_age(now - 3 * 3_600_000, now), "3h ago");
        assert_eq!(format_age(now - 12 * 86_400_000, now), "12d ago");
        assert_eq!(format_age(now + 5_000, now), "0m ago");
    }
}
