//! ALPN protocol tags and the origin → negotiated-protocol cache.
//!
//! A cache hit lets repeat requests to the same origin skip the TLS
//! handshake that would otherwise be needed just to learn the protocol.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use url::Url;

/// ALPN protocol identifier for HTTP/2 over TLS.
pub const ALPN_HTTP2: &str = "h2";
/// ALPN protocol identifier for HTTP/2 over cleartext TCP.
pub const ALPN_HTTP2C: &str = "h2c";
/// ALPN protocol identifier for HTTP/1.1.
pub const ALPN_HTTP1_1: &str = "http/1.1";
/// ALPN protocol identifier for HTTP/1.0.
pub const ALPN_HTTP1_0: &str = "http/1.0";

/// Negotiated (or synthetically seeded) application protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlpnProtocol {
    /// HTTP/2 over TLS ("h2")
    H2,
    /// HTTP/2 over cleartext TCP ("h2c")
    H2c,
    /// HTTP/1.1 ("http/1.1")
    Http11,
    /// HTTP/1.0 ("http/1.0")
    Http10,
}

impl AlpnProtocol {
    /// The wire identifier sent in the TLS ALPN extension.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H2 => ALPN_HTTP2,
            Self::H2c => ALPN_HTTP2C,
            Self::Http11 => ALPN_HTTP1_1,
            Self::Http10 => ALPN_HTTP1_0,
        }
    }

    /// Parse a protocol identifier as delivered by the peer.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"h2" => Some(Self::H2),
            b"h2c" => Some(Self::H2c),
            b"http/1.1" => Some(Self::Http11),
            b"http/1.0" => Some(Self::Http10),
            _ => None,
        }
    }

    /// Check if this selects the HTTP/2 framing layer.
    pub fn is_h2(&self) -> bool {
        matches!(self, Self::H2 | Self::H2c)
    }
}

impl fmt::Display for AlpnProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (scheme, host, port) triple used as cache and connection-pool key.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct Origin {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Origin {
    /// Create a new origin key.
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// Derive the origin of a URL, applying scheme default ports.
    pub fn of(url: &Url) -> Self {
        let scheme = url.scheme().to_string();
        let host = url.host_str().unwrap_or("").to_string();
        let port = url.port().unwrap_or(match scheme.as_str() {
            "https" => 443,
            _ => 80,
        });
        Self { scheme, host, port }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[derive(Debug)]
struct CacheEntry {
    protocol: AlpnProtocol,
    expires: Instant,
    last_used: u64,
}

/// Bounded LRU cache with TTL mapping origin → negotiated protocol.
#[derive(Debug)]
pub struct AlpnCache {
    inner: Mutex<AlpnCacheInner>,
    ttl: Duration,
    max_entries: usize,
}

#[derive(Debug)]
struct AlpnCacheInner {
    entries: HashMap<Origin, CacheEntry>,
    /// Monotonic access clock for LRU ordering.
    clock: u64,
}

impl AlpnCache {
    /// Default time-to-live for a cached negotiation (1 hour).
    pub const DEFAULT_TTL: Duration = Duration::from_millis(3_600_000);

    /// Default maximum number of cached origins.
    pub const DEFAULT_MAX_ENTRIES: usize = 100;

    /// Create a cache with default TTL and capacity.
    pub fn new() -> Self {
        Self::with_config(Self::DEFAULT_TTL, Self::DEFAULT_MAX_ENTRIES)
    }

    /// Create a cache with custom TTL and capacity.
    pub fn with_config(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(AlpnCacheInner {
                entries: HashMap::new(),
                clock: 0,
            }),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Look up the protocol for an origin. Expired entries are evicted,
    /// never returned; a hit refreshes the entry's LRU position.
    pub fn get(&self, origin: &Origin) -> Option<AlpnProtocol> {
        let mut inner = self.inner.lock().expect("ALPN cache mutex poisoned");
        inner.clock += 1;
        let clock = inner.clock;

        if let Some(entry) = inner.entries.get_mut(origin) {
            if entry.expires > Instant::now() {
                entry.last_used = clock;
                return Some(entry.protocol);
            }
            inner.entries.remove(origin);
        }
        None
    }

    /// Record the protocol negotiated (or seeded) for an origin.
    pub fn set(&self, origin: Origin, protocol: AlpnProtocol) {
        let mut inner = self.inner.lock().expect("ALPN cache mutex poisoned");
        inner.clock += 1;
        let clock = inner.clock;

        inner.entries.insert(
            origin,
            CacheEntry {
                protocol,
                expires: Instant::now() + self.ttl,
                last_used: clock,
            },
        );

        // Evict expired first, then least-recently-used beyond capacity.
        if inner.entries.len() > self.max_entries {
            let now = Instant::now();
            inner.entries.retain(|_, e| e.expires > now);
        }
        while inner.entries.len() > self.max_entries {
            if let Some(oldest) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("ALPN cache mutex poisoned");
        inner.entries.clear();
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("ALPN cache mutex poisoned");
        inner.entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AlpnCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(host: &str) -> Origin {
        Origin::new("https", host, 443)
    }

    #[test]
    fn test_protocol_round_trip() {
        for p in [
            AlpnProtocol::H2,
            AlpnProtocol::H2c,
            AlpnProtocol::Http11,
            AlpnProtocol::Http10,
        ] {
            assert_eq!(AlpnProtocol::from_bytes(p.as_str().as_bytes()), Some(p));
        }
        assert_eq!(AlpnProtocol::from_bytes(b"spdy/3"), None);
    }

    #[test]
    fn test_origin_of_url() {
        let url = Url::parse("https://example.com/a/b?q=1").unwrap();
        assert_eq!(Origin::of(&url), Origin::new("https", "example.com", 443));

        let url = Url::parse("http://example.com:8080/").unwrap();
        assert_eq!(Origin::of(&url), Origin::new("http", "example.com", 8080));
    }

    #[test]
    fn test_cache_store_and_retrieve() {
        let cache = AlpnCache::new();
        cache.set(origin("a.example"), AlpnProtocol::H2);

        assert_eq!(cache.get(&origin("a.example")), Some(AlpnProtocol::H2));
        assert_eq!(cache.get(&origin("b.example")), None);
    }

    #[test]
    fn test_cache_ttl_expiry() {
        let cache = AlpnCache::with_config(Duration::from_millis(0), 10);
        cache.set(origin("a.example"), AlpnProtocol::H2);

        // Zero TTL: the entry is expired by the time it is read.
        assert_eq!(cache.get(&origin("a.example")), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_lru_eviction() {
        let cache = AlpnCache::with_config(Duration::from_secs(60), 2);
        cache.set(origin("a.example"), AlpnProtocol::H2);
        cache.set(origin("b.example"), AlpnProtocol::Http11);

        // Touch "a" so "b" becomes the LRU entry.
        assert!(cache.get(&origin("a.example")).is_some());

        cache.set(origin("c.example"), AlpnProtocol::H2);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&origin("a.example")).is_some());
        assert!(cache.get(&origin("b.example")).is_none());
        assert!(cache.get(&origin("c.example")).is_some());
    }

    #[test]
    fn test_cache_overwrite_same_origin() {
        let cache = AlpnCache::new();
        cache.set(origin("a.example"), AlpnProtocol::Http11);
        cache.set(origin("a.example"), AlpnProtocol::H2);
        assert_eq!(cache.get(&origin("a.example")), Some(AlpnProtocol::H2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_clear() {
        let cache = AlpnCache::new();
        cache.set(origin("a.example"), AlpnProtocol::H2);
        cache.set(origin("b.example"), AlpnProtocol::Http11);
        cache.clear();
        assert!(cache.is_empty());
    }
}
