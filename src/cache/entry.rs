//! Cached responses, freshness, and Cache-Control handling.

use std::fmt;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use super::CacheConfig;

/// Status codes cacheable by default (RFC 7231 §6.1 heuristic set).
const CACHEABLE_STATUSES: [u16; 8] = [200, 203, 204, 206, 300, 301, 404, 410];

pub fn is_cacheable_status(status: u16) -> bool {
    CACHEABLE_STATUSES.contains(&status)
}

/// Freshness of a stored response at a point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    /// Within `expires`; serve directly.
    Fresh,
    /// Past `expires` but within the stale-while-revalidate window.
    Stale,
    /// Past `stale_until`; evict on next access.
    Expired,
}

/// A raw response as produced by the origin.
#[derive(Clone, Debug)]
pub struct OriginResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl OriginResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A complete response stored for replay.
#[derive(Clone, Debug)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub cached_at: SystemTime,
    pub expires: SystemTime,
    pub stale_until: SystemTime,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl CachedResponse {
    /// Build an entry from an origin response.
    ///
    /// Returns `None` when the response must not be stored (`no-store` or a
    /// non-cacheable status). Invariant: `cached_at <= expires <= stale_until`.
    pub fn from_origin(
        origin: &OriginResponse,
        now: SystemTime,
        config: &CacheConfig,
    ) -> Option<Self> {
        if !is_cacheable_status(origin.status) {
            return None;
        }
        let cc = parse_cache_control(origin.header("cache-control").unwrap_or(""));
        if cc.no_store {
            return None;
        }

        let ttl = cc
            .s_maxage
            .or(cc.max_age)
            .unwrap_or(config.default_ttl);
        let grace = cc.stale_while_revalidate.unwrap_or(config.stale_grace);

        let expires = now + ttl;
        Some(Self {
            status: origin.status,
            headers: origin.headers.clone(),
            body: origin.body.clone(),
            cached_at: now,
            expires,
            stale_until: expires + grace,
            etag: origin.header("etag").map(str::to_string),
            last_modified: origin.header("last-modified").map(str::to_string),
        })
    }

    /// An uncacheable response shaped for hand-off to the caller; it is
    /// already expired and never stored.
    pub(crate) fn passthrough(origin: &OriginResponse, now: SystemTime) -> Self {
        Self {
            status: origin.status,
            headers: origin.headers.clone(),
            body: origin.body.clone(),
            cached_at: now,
            expires: now,
            stale_until: now,
            etag: None,
            last_modified: None,
        }
    }

    pub fn freshness(&self, now: SystemTime) -> Freshness {
        if now <= self.expires {
            Freshness::Fresh
        } else if now <= self.stale_until {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// How long the entry has been in cache.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.cached_at).unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parsed Cache-Control directives relevant to storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct CacheControl {
    pub max_age: Option<Duration>,
    pub s_maxage: Option<Duration>,
    pub stale_while_revalidate: Option<Duration>,
    pub no_store: bool,
}

pub(crate) fn parse_cache_control(header: &str) -> CacheControl {
    let mut cc = CacheControl::default();
    for directive in header.split(',') {
        let directive = directive.trim();
        let (name, value) = match directive.split_once('=') {
            Some((n, v)) => (n.trim(), Some(v.trim().trim_matches('"'))),
            None => (directive, None),
        };
        let seconds = value.and_then(|v| v.parse::<u64>().ok()).map(Duration::from_secs);
        match name.to_ascii_lowercase().as_str() {
            "max-age" => cc.max_age = seconds,
            "s-maxage" => cc.s_maxage = seconds,
            "stale-while-revalidate" => cc.stale_while_revalidate = seconds,
            "no-store" => cc.no_store = true,
            _ => {}
        }
    }
    cc
}

/// Cache key: `method|host|path|query|vary-tuple`.
///
/// The vary tuple is sorted by header name so equivalent requests collide
/// regardless of header order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(method: &str, host: &str, path: &str, query: &str, vary: &[(&str, &str)]) -> Self {
        let mut tuple: Vec<String> = vary
            .iter()
            .map(|(name, value)| format!("{}={value}", name.to_ascii_lowercase()))
            .collect();
        tuple.sort();
        Self(format!(
            "{method}|{host}|{path}|{query}|{}",
            tuple.join("&")
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(status: u16, cache_control: &str) -> OriginResponse {
        OriginResponse {
            status,
            headers: vec![
                ("Cache-Control".to_string(), cache_control.to_string()),
                ("ETag".to_string(), "\"v1\"".to_string()),
            ],
            body: Bytes::from_static(b"hello"),
        }
    }

    #[test]
    fn cache_control_parsing() {
        let cc = parse_cache_control("public, max-age=60, s-maxage=120, stale-while-revalidate=30");
        assert_eq!(cc.max_age, Some(Duration::from_secs(60)));
        assert_eq!(cc.s_maxage, Some(Duration::from_secs(120)));
        assert_eq!(cc.stale_while_revalidate, Some(Duration::from_secs(30)));
        assert!(!cc.no_store);

        assert!(parse_cache_control("no-store").no_store);
        assert_eq!(parse_cache_control("").max_age, None);
    }

    #[test]
    fn s_maxage_wins_over_max_age() {
        let now = SystemTime::UNIX_EPOCH;
        let resp =
            CachedResponse::from_origin(&origin(200, "max-age=60, s-maxage=120"), now, &CacheConfig::default())
                .unwrap();
        assert_eq!(resp.expires, now + Duration::from_secs(120));
    }

    #[test]
    fn default_ttl_applies_without_directives() {
        let now = SystemTime::UNIX_EPOCH;
        let config = CacheConfig::default();
        let resp = CachedResponse::from_origin(&origin(200, "public"), now, &config).unwrap();
        assert_eq!(resp.expires, now + config.default_ttl);
        assert_eq!(resp.stale_until, resp.expires + config.stale_grace);
        assert_eq!(resp.etag.as_deref(), Some("\"v1\""));
    }

    #[test]
    fn no_store_and_bad_status_are_uncacheable() {
        let now = SystemTime::UNIX_EPOCH;
        let config = CacheConfig::default();
        assert!(CachedResponse::from_origin(&origin(200, "no-store"), now, &config).is_none());
        assert!(CachedResponse::from_origin(&origin(500, ""), now, &config).is_none());
        assert!(CachedResponse::from_origin(&origin(404, ""), now, &config).is_some());
    }

    #[test]
    fn freshness_windows() {
        let now = SystemTime::UNIX_EPOCH;
        let resp = CachedResponse::from_origin(
            &origin(200, "max-age=10, stale-while-revalidate=5"),
            now,
            &CacheConfig::default(),
        )
        .unwrap();
        assert_eq!(resp.freshness(now + Duration::from_secs(5)), Freshness::Fresh);
        assert_eq!(resp.freshness(now + Duration::from_secs(12)), Freshness::Stale);
        assert_eq!(resp.freshness(now + Duration::from_secs(16)), Freshness::Expired);
        assert_eq!(resp.age(now + Duration::from_secs(12)), Duration::from_secs(12));
    }

    #[test]
    fn vary_tuple_is_order_insensitive() {
        let a = CacheKey::new(
            "GET",
            "api.example.com",
            "/users",
            "page=2",
            &[("Accept-Encoding", "gzip"), ("Accept", "application/json")],
        );
        let b = CacheKey::new(
            "GET",
            "api.example.com",
            "/users",
            "page=2",
            &[("accept", "application/json"), ("accept-encoding", "gzip")],
        );
        assert_eq!(a, b);

        let c = CacheKey::new("GET", "api.example.com", "/users", "page=3", &[]);
        assert_ne!(a, c);
        assert!(c.as_str().starts_with("GET|api.example.com|/users|page=3|"));
    }
}
