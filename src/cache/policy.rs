//! URL admission policy.
//!
//! Three regex lists decide what happens to an inbound resource URL:
//! the denylist rejects outright, the passlist forwards to the origin
//! without caching (mutable indexes must never be served stale), and the
//! allowlist admits to the cache. Anything unlisted is forwarded.

use regex::Regex;
use thiserror::Error;

use crate::config::PolicySettings;

#[derive(Debug, Error)]
#[error("invalid policy pattern `{pattern}`: {source}")]
pub struct PolicyError {
    pattern: String,
    #[source]
    source: regex::Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Resource may be cached and served from storage.
    Cache,
    /// Resource is rejected with 404.
    Deny,
    /// Resource is forwarded to the origin without caching.
    PassThrough,
}

#[derive(Debug)]
pub struct UrlPolicy {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
    pass: Vec<Regex>,
}

impl UrlPolicy {
    /// Compile the configured lists. Allowlist entries are host+path
    /// prefixes expanded by [`cacheable_pattern`]; deny and pass entries
    /// are raw regexes matched against the full URL.
    pub fn from_settings(settings: &PolicySettings) -> Result<Self, PolicyError> {
        Ok(Self {
            allow: compile(settings.allow.iter().map(|p| cacheable_pattern(p)))?,
            deny: compile(settings.deny.iter().cloned())?,
            pass: compile(settings.pass.iter().cloned())?,
        })
    }

    pub fn decide(&self, url: &str) -> PolicyDecision {
        if self.deny.iter().any(|re| re.is_match(url)) {
            return PolicyDecision::Deny;
        }
        if self.pass.iter().any(|re| re.is_match(url)) {
            return PolicyDecision::PassThrough;
        }
        if self.allow.iter().any(|re| re.is_match(url)) {
            return PolicyDecision::Cache;
        }
        PolicyDecision::PassThrough
    }
}

/// Expand a bare `host/path` pattern into an anchored URL regex: optional
/// `www.`, http/https/ftp scheme, and exactly one trailing path segment
/// (the artifact filename). Literal dots in the pattern are escaped.
fn cacheable_pattern(pattern: &str) -> String {
    format!(
        r"^(https?|ftp)://(www\.)?{}/[^/]+$",
        pattern.replace('.', r"\.")
    )
}

fn compile(patterns: impl Iterator<Item = String>) -> Result<Vec<Regex>, PolicyError> {
    patterns
        .map(|pattern| {
            Regex::new(&pattern).map_err(|source| PolicyError { pattern, source })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> UrlPolicy {
        UrlPolicy::from_settings(&PolicySettings {
            allow: vec![
                "fftw.org".to_string(),
                "github.com/[^/]+/[^/]+/archive".to_string(),
            ],
            deny: vec!["favicon\\.ico".to_string()],
            pass: vec![".*/repomd\\.xml".to_string()],
        })
        .expect("compile policy")
    }

    #[test]
    fn allowlisted_urls_are_cacheable() {
        let p = policy();
        assert_eq!(
            p.decide("https://fftw.org/fftw-3.3.10.tar.gz"),
            PolicyDecision::Cache
        );
        assert_eq!(
            p.decide("https://www.fftw.org/fftw-3.3.10.tar.gz"),
            PolicyDecision::Cache
        );
        assert_eq!(
            p.decide("https://github.com/foo/bar/archive/v1.0.tar.gz"),
            PolicyDecision::Cache
        );
    }

    #[test]
    fn allowlist_requires_exactly_one_trailing_segment() {
        let p = policy();
        assert_eq!(
            p.decide("https://fftw.org/deep/fftw-3.3.10.tar.gz"),
            PolicyDecision::PassThrough
        );
        assert_eq!(p.decide("https://fftw.org/"), PolicyDecision::PassThrough);
    }

    #[test]
    fn denylist_wins_over_everything() {
        let p = policy();
        assert_eq!(
            p.decide("https://fftw.org/favicon.ico"),
            PolicyDecision::Deny
        );
    }

    #[test]
    fn passlist_overrides_allowlist() {
        let p = policy();
        assert_eq!(
            p.decide("https://fftw.org/repomd.xml"),
            PolicyDecision::PassThrough
        );
    }

    #[test]
    fn unlisted_urls_pass_through() {
        let p = policy();
        assert_eq!(
            p.decide("https://unknown.example.org/file.tar.gz"),
            PolicyDecision::PassThrough
        );
    }

    #[test]
    fn dots_in_patterns_are_literal() {
        let p = policy();
        assert_eq!(
            p.decide("https://fftwxorg/evil.tar.gz"),
            PolicyDecision::PassThrough
        );
    }

    #[test]
    fn invalid_pattern_reports_the_pattern() {
        let err = UrlPolicy::from_settings(&PolicySettings {
            allow: vec!["[unclosed".to_string()],
            deny: Vec::new(),
            pass: Vec::new(),
        })
        .expect_err("should fail");
        assert!(err.to_string().contains("[unclosed"));
    }
}
