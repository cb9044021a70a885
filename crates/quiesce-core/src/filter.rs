//! Glob filters for token handles that never count as busy.
//!
//! Test harnesses commonly blacklist long-polling or analytics URLs so that a
//! request which never finishes does not keep the application "busy" forever.
//! A [`HandleFilter`] holds those patterns; the activity tracker consults it
//! when reporting active tokens.
//!
//! Patterns support `*` (any run of characters) and `?` (one character).
//! A pattern without wildcards must match the handle exactly.
//!
//! ```
//! use quiesce_core::filter::HandleFilter;
//!
//! let filter = HandleFilter::new(["*analytics*", "https://cdn.example.com/*"]);
//! assert!(filter.matches("https://cdn.example.com/logo.png"));
//! assert!(!filter.matches("https://api.example.com/login"));
//! ```

use serde::{Deserialize, Serialize};

/// A set of glob patterns matched against token handles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleFilter {
    patterns: Vec<String>,
}

impl HandleFilter {
    /// Creates a filter from a list of glob patterns.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns `true` if the filter has no patterns.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The configured patterns, in insertion order.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Returns `true` if any pattern matches `handle`.
    pub fn matches(&self, handle: &str) -> bool {
        self.patterns.iter().any(|pattern| glob_match(pattern, handle))
    }
}

/// Returns true if the pattern contains glob wildcard characters (`*` or `?`).
fn has_wildcard(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Matches a string against a glob pattern with `*` (any chars) and `?` (single char).
///
/// When the pattern has no wildcards, falls back to exact equality.
fn glob_match(pattern: &str, text: &str) -> bool {
    if !has_wildcard(pattern) {
        return pattern == text;
    }

    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    let (plen, tlen) = (pat.len(), txt.len());

    // prev[j] = pattern[..i-1] matches text[..j]
    let mut prev = vec![false; tlen + 1];
    prev[0] = true;

    for i in 1..=plen {
        let mut row = vec![false; tlen + 1];
        if pat[i - 1] == '*' {
            row[0] = prev[0];
        }
        for j in 1..=tlen {
            row[j] = match pat[i - 1] {
                '*' => prev[j] || row[j - 1],
                '?' => prev[j - 1],
                c => c == txt[j - 1] && prev[j - 1],
            };
        }
        prev = row;
    }

    prev[tlen]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_pattern_requires_equality() {
        assert!(glob_match("https://a.test/x", "https://a.test/x"));
        assert!(!glob_match("https://a.test/x", "https://a.test/xy"));
    }

    #[test]
    fn test_star_matches_any_run() {
        assert!(glob_match("*analytics*", "https://analytics.test/track"));
        assert!(glob_match("https://*/ping", "https://host.test/ping"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("https://*/ping", "https://host.test/pong"));
    }

    #[test]
    fn test_question_mark_matches_one_char() {
        assert!(glob_match("v?/status", "v2/status"));
        assert!(!glob_match("v?/status", "v10/status"));
    }

    #[test]
    fn test_empty_filter_matches_nothing() {
        let filter = HandleFilter::default();
        assert!(filter.is_empty());
        assert!(!filter.matches("anything"));
    }

    #[test]
    fn test_filter_matches_if_any_pattern_does() {
        let filter = HandleFilter::new(["*.png", "wss://*"]);
        assert!(filter.matches("https://cdn.test/a.png"));
        assert!(filter.matches("wss://socket.test/live"));
        assert!(!filter.matches("https://api.test/users"));
        assert_eq!(filter.patterns().len(), 2);
    }

    #[test]
    fn test_filter_serializes_as_plain_list() {
        let filter = HandleFilter::new(["*.png"]);
        let json = serde_json::to_string(&filter).unwrap();
        assert_eq!(json, r#"["*.png"]"#);
    }
}
