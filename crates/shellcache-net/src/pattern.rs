//! URL patterns and exclusion lists.

use serde::{Deserialize, Serialize};
use url::Url;

/// URL pattern for matching.
///
/// Serialized externally tagged, e.g. `{"contains": "google"}` or
/// `{"domain": "googleapis.com"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlPattern {
    /// Exact URL match.
    Exact(String),
    /// Prefix match on the full URL.
    Prefix(String),
    /// Substring anywhere in the full URL, including path and query.
    Contains(String),
    /// Host equals the domain or is one of its subdomains.
    Domain(String),
}

impl UrlPattern {
    /// Create a contains pattern.
    pub fn contains(substring: &str) -> Self {
        Self::Contains(substring.to_string())
    }

    /// Create a domain pattern.
    pub fn domain(domain: &str) -> Self {
        Self::Domain(domain.trim_start_matches('.').to_ascii_lowercase())
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        let url_str = url.as_str();
        match self {
            UrlPattern::Exact(pattern) => url_str == pattern,
            UrlPattern::Prefix(pattern) => url_str.starts_with(pattern.as_str()),
            UrlPattern::Contains(pattern) => url_str.contains(pattern.as_str()),
            UrlPattern::Domain(domain) => match url.host_str() {
                Some(host) => {
                    host == domain
                        || host
                            .strip_suffix(domain.as_str())
                            .is_some_and(|rest| rest.ends_with('.'))
                }
                None => false,
            },
        }
    }

    /// The raw pattern text.
    pub fn as_str(&self) -> &str {
        match self {
            UrlPattern::Exact(p)
            | UrlPattern::Prefix(p)
            | UrlPattern::Contains(p)
            | UrlPattern::Domain(p) => p,
        }
    }
}

/// Requests whose URL matches any pattern here are never handled by the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExclusionList {
    patterns: Vec<UrlPattern>,
}

impl ExclusionList {
    /// Create an exclusion list.
    pub fn new(patterns: Vec<UrlPattern>) -> Self {
        Self { patterns }
    }

    /// Substring patterns for each entry.
    pub fn substrings<'a>(substrings: impl IntoIterator<Item = &'a str>) -> Self {
        Self::new(substrings.into_iter().map(UrlPattern::contains).collect())
    }

    /// First pattern matching `url`.
    pub fn find_match(&self, url: &Url) -> Option<&UrlPattern> {
        self.patterns.iter().find(|p| p.matches(url))
    }

    /// Check if `url` is excluded.
    pub fn is_excluded(&self, url: &Url) -> bool {
        self.find_match(url).is_some()
    }

    pub fn patterns(&self) -> &[UrlPattern] {
        &self.patterns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_url_pattern_exact_and_prefix() {
        let exact = UrlPattern::Exact("https://calc.example/".into());
        assert!(exact.matches(&url("https://calc.example/")));
        assert!(!exact.matches(&url("https://calc.example/page")));

        let prefix = UrlPattern::Prefix("https://calc.example/api/".into());
        assert!(prefix.matches(&url("https://calc.example/api/sum")));
        assert!(!prefix.matches(&url("https://calc.example/index.html")));
    }

    #[test]
    fn test_contains_is_coarse() {
        let pattern = UrlPattern::contains("google");
        assert!(pattern.matches(&url("https://www.googletagmanager.com/gtm.js")));
        // Same-origin assets containing the word are caught too.
        assert!(pattern.matches(&url("https://calc.example/img/google-logo.png")));
    }

    #[test]
    fn test_domain_matches_host_and_subdomains() {
        let pattern = UrlPattern::domain("googleapis.com");
        assert!(pattern.matches(&url("https://googleapis.com/x")));
        assert!(pattern.matches(&url("https://firestore.googleapis.com/v1")));
        assert!(!pattern.matches(&url("https://notgoogleapis.com/")));
        assert!(!pattern.matches(&url("https://calc.example/googleapis.com")));
    }

    #[test]
    fn test_exclusion_list() {
        let list = ExclusionList::substrings(["firebase", "admob"]);
        assert!(list.is_excluded(&url("https://calc.firebaseapp.com/__/auth")));
        assert_eq!(
            list.find_match(&url("https://admob.example/ad")).map(UrlPattern::as_str),
            Some("admob")
        );
        assert!(!list.is_excluded(&url("https://calc.example/index.html")));
    }

    #[test]
    fn test_exclusion_list_serde() {
        let list: ExclusionList =
            serde_json::from_str(r#"[{"contains":"google"},{"domain":"admob.com"}]"#).unwrap();
        assert_eq!(
            list.patterns(),
            &[UrlPattern::contains("google"), UrlPattern::domain("admob.com")]
        );
    }
}
