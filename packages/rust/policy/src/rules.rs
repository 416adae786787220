//! Allow/deny URL rules.
//!
//! Patterns are globs where `*` matches any run of characters, including `/`,
//! so `*/archive/*` rejects an archive section anywhere on any host. Rules are
//! compiled once per ingestion run and evaluated without I/O.

use regex::Regex;

use concierge_shared::{ConciergeError, Result};

/// Outcome of evaluating a URL against the rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleVerdict {
    /// The URL passed the rules.
    Permitted,
    /// A deny pattern matched. Deny always wins.
    Denied,
    /// The allow list is non-empty and nothing on it matched.
    NotAllowlisted,
}

/// Compiled allow/deny patterns.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
}

impl RuleSet {
    /// Compile glob patterns into a rule set. Fails on a malformed pattern
    /// rather than silently skipping it.
    pub fn compile(allow_patterns: &[String], deny_patterns: &[String]) -> Result<Self> {
        Ok(Self {
            allow: compile_globs(allow_patterns)?,
            deny: compile_globs(deny_patterns)?,
        })
    }

    /// Evaluate a URL. Deny patterns are checked first; an empty allow list
    /// permits everything that no deny pattern rejects.
    pub fn evaluate(&self, url: &str) -> RuleVerdict {
        if self.deny.iter().any(|re| re.is_match(url)) {
            return RuleVerdict::Denied;
        }

        if self.allow.is_empty() || self.allow.iter().any(|re| re.is_match(url)) {
            RuleVerdict::Permitted
        } else {
            RuleVerdict::NotAllowlisted
        }
    }

    /// Convenience wrapper for callers that only need a yes/no.
    pub fn permits(&self, url: &str) -> bool {
        self.evaluate(url) == RuleVerdict::Permitted
    }
}

fn compile_globs(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns.iter().map(|p| glob_to_regex(p)).collect()
}

/// Translate a glob pattern into an anchored regex. `*` becomes `.*` and
/// everything else is matched literally.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for (i, segment) in pattern.split('*').enumerate() {
        if i > 0 {
            source.push_str(".*");
        }
        source.push_str(&regex::escape(segment));
    }
    source.push('$');

    Regex::new(&source)
        .map_err(|e| ConciergeError::config(format!("invalid URL pattern '{pattern}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(allow: &[&str], deny: &[&str]) -> RuleSet {
        let allow: Vec<String> = allow.iter().map(|s| s.to_string()).collect();
        let deny: Vec<String> = deny.iter().map(|s| s.to_string()).collect();
        RuleSet::compile(&allow, &deny).expect("compile")
    }

    #[test]
    fn star_crosses_path_separators() {
        let rs = rules(&[], &["*/archive/*"]);
        assert_eq!(
            rs.evaluate("https://example.com/archive/old"),
            RuleVerdict::Denied
        );
        assert_eq!(
            rs.evaluate("https://example.com/blog/archive/2019"),
            RuleVerdict::Denied
        );
        assert_eq!(
            rs.evaluate("https://example.com/blog/post"),
            RuleVerdict::Permitted
        );
    }

    #[test]
    fn deny_wins_over_allow() {
        let rs = rules(&["https://example.com/*"], &["*/private/*"]);
        assert_eq!(
            rs.evaluate("https://example.com/private/page"),
            RuleVerdict::Denied
        );
        assert_eq!(
            rs.evaluate("https://example.com/public"),
            RuleVerdict::Permitted
        );
    }

    #[test]
    fn nonempty_allowlist_is_default_deny() {
        let rs = rules(&["https://docs.example.com/*"], &[]);
        assert_eq!(
            rs.evaluate("https://docs.example.com/guide"),
            RuleVerdict::Permitted
        );
        assert_eq!(
            rs.evaluate("https://other.example.com/guide"),
            RuleVerdict::NotAllowlisted
        );
    }

    #[test]
    fn empty_rules_permit_everything() {
        let rs = rules(&[], &[]);
        assert_eq!(rs.evaluate("https://anywhere.net/x"), RuleVerdict::Permitted);
    }

    #[test]
    fn literal_regex_chars_are_escaped() {
        let rs = rules(&["https://example.com/a+b?*"], &[]);
        assert_eq!(
            rs.evaluate("https://example.com/a+b?page=1"),
            RuleVerdict::Permitted
        );
        assert_eq!(
            rs.evaluate("https://example.com/aab"),
            RuleVerdict::NotAllowlisted
        );
    }

    #[test]
    fn trailing_star_matches_suffix() {
        let rs = rules(&["https://example.com/docs*"], &[]);
        assert_eq!(
            rs.evaluate("https://example.com/docs/intro"),
            RuleVerdict::Permitted
        );
        assert_eq!(
            rs.evaluate("https://example.com/docs"),
            RuleVerdict::Permitted
        );
    }
}
