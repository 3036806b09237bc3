//! Channel pattern matching.
//!
//! Pub/sub pattern subscriptions use glob-style patterns such as
//! `__keyspace@0__:data:*.value`. Only `*` (any run of characters, including
//! none) is supported, matched without regex.

/// A compiled glob pattern for channel names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPattern {
    raw: String,
    /// Literal pieces between `*` wildcards.
    parts: Vec<String>,
}

impl ChannelPattern {
    /// Compile a pattern.
    pub fn new(pattern: &str) -> Self {
        Self {
            raw: pattern.to_string(),
            parts: pattern.split('*').map(String::from).collect(),
        }
    }

    /// Check if a channel name matches this pattern.
    pub fn matches(&self, channel: &str) -> bool {
        // No wildcard: exact match
        if self.parts.len() == 1 {
            return self.parts[0] == channel;
        }

        let first = &self.parts[0];
        let last = &self.parts[self.parts.len() - 1];
        if channel.len() < first.len() + last.len()
            || !channel.starts_with(first.as_str())
            || !channel.ends_with(last.as_str())
        {
            return false;
        }

        // Middle pieces must appear in order between prefix and suffix
        let mut rest = &channel[first.len()..channel.len() - last.len()];
        for part in &self.parts[1..self.parts.len() - 1] {
            match rest.find(part.as_str()) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
        true
    }

    /// Get the raw pattern string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_pattern() {
        let pattern = ChannelPattern::new("operate:10.0.0.5:2404");
        assert!(pattern.matches("operate:10.0.0.5:2404"));
        assert!(!pattern.matches("operate:10.0.0.6:2404"));
    }

    #[test]
    fn test_keyspace_pattern() {
        let pattern = ChannelPattern::new("__keyspace@0__:data:*.value");
        assert!(pattern.matches("__keyspace@0__:data:10.0.0.5:2404-100.value"));
        assert!(!pattern.matches("__keyspace@0__:data:10.0.0.5:2404-100.ASDU"));
        assert!(!pattern.matches("__keyspace@0__:connections:10.0.0.5:2404.active"));
    }

    #[test]
    fn test_multiple_wildcards() {
        let pattern = ChannelPattern::new("a*b*c");
        assert!(pattern.matches("abc"));
        assert!(pattern.matches("a-x-b-y-c"));
        assert!(!pattern.matches("a-x-c"));
        assert!(!pattern.matches("ac"));
    }

    #[test]
    fn test_full_wildcard() {
        let pattern = ChannelPattern::new("*");
        assert!(pattern.matches(""));
        assert!(pattern.matches("anything:at:all"));
    }
}
