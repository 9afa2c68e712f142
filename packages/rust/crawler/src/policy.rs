//! Link-following policy and SSRF protection.
//!
//! A link is followed only if it stays on the crawl's domain, avoids the
//! blocklist, and either matches a priority keyword or is discovered on the
//! root page (depth 0), which bootstraps discovery.

use std::net::IpAddr;

use recordflow_shared::CrawlConfig;
use url::Url;

/// File extensions that are assets, never pages.
const NON_PAGE_EXTENSIONS: &[&str] = &[
    ".pdf", ".jpg", ".jpeg", ".png", ".gif", ".webp", ".svg", ".bmp", ".zip", ".doc", ".docx",
    ".mp4", ".mp3",
];

/// Outcome of evaluating a discovered link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDecision {
    /// Not http(s), or a different domain.
    OffDomain,
    /// Points at a downloadable file rather than a page.
    NotAPage,
    /// Path contains a blocklisted keyword.
    Blocked,
    /// Path contains a priority keyword.
    Priority,
    /// Discovered on the root page; followed once to bootstrap discovery.
    Bootstrap,
    /// Deeper than the root and not a priority page.
    NotPriority,
}

impl LinkDecision {
    /// Whether the link should be queued.
    pub fn follows(self) -> bool {
        matches!(self, Self::Priority | Self::Bootstrap)
    }
}

/// Keyword and domain rules for one crawl.
#[derive(Debug, Clone)]
pub struct LinkPolicy {
    domain: String,
    priority_keywords: Vec<String>,
    ignored_keywords: Vec<String>,
}

impl LinkPolicy {
    /// Build the policy for a crawl rooted at `domain` (see [`domain_of`]).
    pub fn new(domain: impl Into<String>, config: &CrawlConfig) -> Self {
        let lower = |words: &[String]| words.iter().map(|w| w.to_lowercase()).collect();
        Self {
            domain: domain.into(),
            priority_keywords: lower(&config.priority_keywords),
            ignored_keywords: lower(&config.ignored_keywords),
        }
    }

    /// Decide whether `link`, found on a page at `depth`, should be queued.
    pub fn decide(&self, link: &Url, depth: u32) -> LinkDecision {
        if domain_of(link).as_deref() != Some(self.domain.as_str()) {
            return LinkDecision::OffDomain;
        }

        let path = link.path().to_lowercase();
        if NON_PAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
            return LinkDecision::NotAPage;
        }

        let haystack = match link.query() {
            Some(q) => format!("{path}?{}", q.to_lowercase()),
            None => path,
        };

        if self.ignored_keywords.iter().any(|k| haystack.contains(k)) {
            return LinkDecision::Blocked;
        }
        if self.priority_keywords.iter().any(|k| haystack.contains(k)) {
            return LinkDecision::Priority;
        }
        if depth == 0 {
            LinkDecision::Bootstrap
        } else {
            LinkDecision::NotPriority
        }
    }
}

/// The crawl domain of a URL: lowercase host without a leading `www.`.
///
/// Returns `None` for non-http(s) URLs or URLs without a host.
pub fn domain_of(url: &Url) -> Option<String> {
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    let host = url.host_str()?.to_lowercase();
    Some(host.strip_prefix("www.").map(str::to_string).unwrap_or(host))
}

/// Normalize a URL for deduplication (strip fragment and trailing slash).
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    let mut s = normalized.to_string();
    // Remove trailing slash for consistency (except root path)
    if s.ends_with('/') && s.matches('/').count() > 3 {
        s.pop();
    }
    s
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub fn is_ssrf_target(url: &Url) -> bool {
    // Block non-HTTP schemes
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> LinkPolicy {
        LinkPolicy::new("sunshine.example", &CrawlConfig::default())
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn domain_strips_www() {
        assert_eq!(
            domain_of(&url("https://WWW.Sunshine.example/about")).as_deref(),
            Some("sunshine.example")
        );
        assert_eq!(domain_of(&url("mailto:hi@sunshine.example")), None);
    }

    #[test]
    fn off_domain_never_followed() {
        let p = policy();
        assert_eq!(
            p.decide(&url("https://other.example/about"), 0),
            LinkDecision::OffDomain
        );
        assert_eq!(
            p.decide(&url("https://www.sunshine.example/about"), 0),
            LinkDecision::Priority
        );
    }

    #[test]
    fn blocklist_beats_priority_and_depth() {
        let p = policy();
        // "news" is blocked even at the root, and even next to a priority word
        assert_eq!(
            p.decide(&url("https://sunshine.example/news"), 0),
            LinkDecision::Blocked
        );
        assert_eq!(
            p.decide(&url("https://sunshine.example/about/privacy"), 0),
            LinkDecision::Blocked
        );
    }

    #[test]
    fn priority_followed_at_any_depth() {
        let p = policy();
        assert!(p.decide(&url("https://sunshine.example/our-staff"), 2).follows());
        assert!(p.decide(&url("https://sunshine.example/Tuition-Rates"), 1).follows());
    }

    #[test]
    fn bootstrap_only_at_root() {
        let p = policy();
        let plain = url("https://sunshine.example/locations");
        assert_eq!(p.decide(&plain, 0), LinkDecision::Bootstrap);
        assert_eq!(p.decide(&plain, 1), LinkDecision::NotPriority);
        assert!(!p.decide(&plain, 1).follows());
    }

    #[test]
    fn files_are_not_pages() {
        let p = policy();
        assert_eq!(
            p.decide(&url("https://sunshine.example/about/handbook.PDF"), 0),
            LinkDecision::NotAPage
        );
    }

    #[test]
    fn host_does_not_trigger_keywords() {
        let p = LinkPolicy::new("newsome-academy.example", &CrawlConfig::default());
        assert_eq!(
            p.decide(&url("https://newsome-academy.example/programs"), 1),
            LinkDecision::Priority
        );
    }

    #[test]
    fn test_normalize_url() {
        let u = url("https://sunshine.example/about/#team");
        assert_eq!(normalize_url(&u), "https://sunshine.example/about");
        assert_eq!(
            normalize_url(&url("https://sunshine.example/")),
            "https://sunshine.example/"
        );
    }

    #[test]
    fn test_ssrf_protection_blocks_private_ip() {
        assert!(is_ssrf_target(&url("http://192.168.1.1/admin")));
        assert!(is_ssrf_target(&url("http://10.0.0.1/")));
        assert!(is_ssrf_target(&url("http://127.0.0.1:8080/")));
        assert!(is_ssrf_target(&url("http://[::1]/")));
        assert!(is_ssrf_target(&url("file:///etc/passwd")));
    }

    #[test]
    fn test_ssrf_blocks_localhost() {
        assert!(is_ssrf_target(&url("http://localhost:3000/api")));
    }

    #[test]
    fn test_ssrf_protection_allows_public() {
        assert!(!is_ssrf_target(&url("https://sunshine.example/page")));
    }
}
