//! Channel pattern matching.
//!
//! `*` matches any run of characters (including none, including `:`), and
//! the pattern is anchored at both ends. Every other character is literal.

/// Whether `channel` contains a wildcard.
pub fn is_pattern(channel: &str) -> bool {
    channel.contains('*')
}

/// Check a pattern against a concrete channel name.
pub fn matches(pattern: &str, channel: &str) -> bool {
    if !is_pattern(pattern) {
        return pattern == channel;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let first = parts[0];
    let last = parts[parts.len() - 1];

    let Some(mut rest) = channel.strip_prefix(first) else {
        return false;
    };
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal() {
        assert!(matches("agent:status", "agent:status"));
        assert!(!matches("agent:status", "agent:statuses"));
        assert!(!matches("agent", "agent:status"));
    }

    #[test]
    fn test_trailing_wildcard() {
        assert!(matches("agent:*", "agent:failure"));
        assert!(matches("agent:*", "agent:status"));
        assert!(matches("agent:*", "agent:"));
        assert!(matches("agent:*", "agent:a:b"));
        assert!(!matches("agent:*", "system:error"));
        assert!(!matches("agent:*", "agent"));
    }

    #[test]
    fn test_inner_and_leading_wildcards() {
        assert!(matches("*", ""));
        assert!(matches("*", "anything:at:all"));
        assert!(matches("*:error", "system:error"));
        assert!(matches("task:*:done", "task:build:done"));
        assert!(matches("a*b*c", "abc"));
        assert!(matches("a*b*c", "axxbyyc"));
        assert!(!matches("a*b*c", "axxcyyb"));
        assert!(!matches("a*a", "a"));
    }

    #[test]
    fn test_regex_characters_are_literal() {
        assert!(matches("metrics.cpu*", "metrics.cpu0"));
        assert!(!matches("metrics.cpu*", "metricsxcpu0"));
        assert!(matches("q?*", "q?x"));
        assert!(!matches("q?*", "qx"));
    }

    #[test]
    fn test_is_pattern() {
        assert!(is_pattern("agent:*"));
        assert!(!is_pattern("agent:status"));
    }
}
