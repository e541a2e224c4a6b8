//! Maps request URLs onto rate-limit buckets.

use regex::Regex;
use reqwest::Url;
use std::fmt;
use std::sync::LazyLock;

use crate::config::Config;

/// Numeric ids, UUIDs and prefixed object ids such as `lead_8aF3k`.
static ID_SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d+|[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}|[a-z]+_[A-Za-z0-9]+)$",
    )
    .expect("id segment pattern is valid")
});

/// Resource roots whose second segment names a distinct endpoint.
const COMPOUND_ROOTS: &[&str] = &["data"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BucketKey {
    /// Call to the rate-limited API, accounted against this bucket
    Throttled(String),
    /// Call to any other host; never delayed
    Unthrottled,
}

impl BucketKey {
    pub fn as_str(&self) -> &str {
        match self {
            BucketKey::Throttled(key) => key,
            BucketKey::Unthrottled => "unthrottled",
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct BucketKeyClassifier {
    host: String,
    prefix: Vec<String>,
}

impl BucketKeyClassifier {
    pub fn new(host: &str, path_prefix: &str) -> Self {
        Self {
            host: host.to_ascii_lowercase(),
            prefix: path_prefix
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(|segment| segment.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.api_host, &config.api_path_prefix)
    }

    /// Pure function of host and path; query, fragment and ids are dropped.
    pub fn classify(&self, url: &str) -> BucketKey {
        let Ok(parsed) = Url::parse(url.trim()) else {
            return BucketKey::Unthrottled;
        };

        if !matches!(parsed.scheme(), "http" | "https") {
            return BucketKey::Unthrottled;
        }

        match parsed.host_str() {
            Some(host) if host.eq_ignore_ascii_case(&self.host) => {}
            _ => return BucketKey::Unthrottled,
        }

        let segments: Vec<&str> = parsed
            .path_segments()
            .map(|split| split.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        BucketKey::Throttled(self.key_for_segments(&segments))
    }

    fn key_for_segments(&self, segments: &[&str]) -> String {
        let prefix_len = self.prefix.len();
        let under_prefix = segments.len() > prefix_len
            && segments
                .iter()
                .zip(&self.prefix)
                .all(|(segment, expected)| segment.eq_ignore_ascii_case(expected));

        if !under_prefix {
            return self.prefix_key();
        }

        let root = segments[prefix_len];
        let mut kept: Vec<&str> = segments[..=prefix_len].to_vec();

        if COMPOUND_ROOTS.iter().any(|c| root.eq_ignore_ascii_case(c)) {
            if let Some(next) = segments.get(prefix_len + 1) {
                if !ID_SEGMENT.is_match(next) {
                    kept.push(next);
                }
            }
        }

        format!("/{}/", kept.join("/"))
    }

    fn prefix_key(&self) -> String {
        if self.prefix.is_empty() {
            "/".to_string()
        } else {
            format!("/{}/", self.prefix.join("/"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> BucketKeyClassifier {
        BucketKeyClassifier::new("api.close.com", "/api/v1/")
    }

    fn key(url: &str) -> String {
        match classifier().classify(url) {
            BucketKey::Throttled(key) => key,
            BucketKey::Unthrottled => panic!("expected throttled key for {url}"),
        }
    }

    #[test]
    fn test_resource_ids_collapse_to_root() {
        assert_eq!(key("https://api.close.com/api/v1/lead/lead_123/"), "/api/v1/lead/");
        assert_eq!(key("https://api.close.com/api/v1/lead/lead_456/"), "/api/v1/lead/");
        assert_eq!(
            key("https://api.close.com/api/v1/lead/lead_456/activity/"),
            "/api/v1/lead/"
        );
        assert_eq!(key("https://api.close.com/api/v1/task/42"), "/api/v1/task/");
    }

    #[test]
    fn test_query_string_is_ignored() {
        assert_eq!(
            key("https://api.close.com/api/v1/activity/?lead_id=lead_1&_limit=10"),
            "/api/v1/activity/"
        );
        assert_eq!(key("https://api.close.com/api/v1/me#frag"), "/api/v1/me/");
    }

    #[test]
    fn test_compound_roots_keep_endpoint_segment() {
        assert_eq!(
            key("https://api.close.com/api/v1/data/search/"),
            "/api/v1/data/search/"
        );
        assert_eq!(key("https://api.close.com/api/v1/data/"), "/api/v1/data/");
        assert_eq!(key("https://api.close.com/api/v1/data/12345/"), "/api/v1/data/");
    }

    #[test]
    fn test_host_is_case_insensitive_and_case_of_path_is_kept() {
        assert_eq!(key("https://API.Close.com/api/v1/Lead/lead_1/"), "/api/v1/Lead/");
    }

    #[test]
    fn test_paths_outside_prefix_share_one_bucket() {
        assert_eq!(key("https://api.close.com/"), "/api/v1/");
        assert_eq!(key("https://api.close.com/api/v2/lead/"), "/api/v1/");
        assert_eq!(key("https://api.close.com/api/v1/"), "/api/v1/");
    }

    #[test]
    fn test_other_hosts_are_unthrottled() {
        let classifier = classifier();
        assert_eq!(
            classifier.classify("https://api.instantly.ai/api/v1/lead/"),
            BucketKey::Unthrottled
        );
        assert_eq!(
            classifier.classify("https://evil.api.close.com.example/api/v1/lead/"),
            BucketKey::Unthrottled
        );
        assert_eq!(classifier.classify("ftp://api.close.com/api/v1/lead/"), BucketKey::Unthrottled);
        assert_eq!(classifier.classify("not a url"), BucketKey::Unthrottled);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = classifier();
        let url = "https://api.close.com/api/v1/contact/cont_9/";
        assert_eq!(classifier.classify(url), classifier.classify(url));
    }
}
