//! Client context: the ALPN cache, connection pools, session cache, and
//! static options shared by every request issued through it.
//!
//! Distinct contexts are fully isolated; nothing is shared between them.

use std::sync::Arc;
use std::time::Duration;

use crate::alpn::{AlpnCache, AlpnProtocol};
use crate::error::Result;
use crate::pool::h1::{H1Options, H1Pool};
use crate::request::RequestOptions;
use crate::response::Response;
use crate::transport::connector::{ConnectorOptions, TlsConnector};
use crate::transport::h1::H1Transport;
use crate::transport::h2::{H2Options, H2Transport};

/// User-agent sent when the caller does not provide one.
pub const DEFAULT_USER_AGENT: &str =
    concat!("polyglot-fetch/", env!("CARGO_PKG_VERSION"));

/// Builder for a [`Context`].
#[derive(Debug)]
pub struct ContextBuilder {
    user_agent: Option<String>,
    overwrite_user_agent: bool,
    alpn_protocols: Vec<AlpnProtocol>,
    alpn_cache_ttl: Duration,
    alpn_cache_size: usize,
    h1: H1Options,
    h2: H2Options,
    reject_unauthorized: bool,
    max_cached_sessions: usize,
    connect_timeout: Option<Duration>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            overwrite_user_agent: false,
            alpn_protocols: vec![
                AlpnProtocol::H2,
                AlpnProtocol::Http11,
                AlpnProtocol::Http10,
            ],
            alpn_cache_ttl: AlpnCache::DEFAULT_TTL,
            alpn_cache_size: AlpnCache::DEFAULT_MAX_ENTRIES,
            h1: H1Options::default(),
            h2: H2Options::default(),
            reject_unauthorized: true,
            max_cached_sessions: 100,
            connect_timeout: None,
        }
    }
}

impl ContextBuilder {
    /// Start from the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the user-agent applied to outgoing requests.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Replace a caller-supplied `user-agent` header too, instead of only
    /// filling it in when absent.
    pub fn overwrite_user_agent(mut self, overwrite: bool) -> Self {
        self.overwrite_user_agent = overwrite;
        self
    }

    /// Ordered ALPN protocol preference list.
    pub fn alpn_protocols(mut self, protocols: Vec<AlpnProtocol>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    /// Time-to-live for cached ALPN negotiations.
    pub fn alpn_cache_ttl(mut self, ttl: Duration) -> Self {
        self.alpn_cache_ttl = ttl;
        self
    }

    /// Maximum number of origins in the ALPN cache.
    pub fn alpn_cache_size(mut self, size: usize) -> Self {
        self.alpn_cache_size = size;
        self
    }

    /// HTTP/1 pool tunables.
    pub fn h1(mut self, options: H1Options) -> Self {
        self.h1 = options;
        self
    }

    /// HTTP/2 session tunables and push handlers.
    pub fn h2(mut self, options: H2Options) -> Self {
        self.h2 = options;
        self
    }

    /// Verify peer certificates (default true).
    pub fn reject_unauthorized(mut self, reject: bool) -> Self {
        self.reject_unauthorized = reject;
        self
    }

    /// TLS client session cache size for handshake resumption.
    pub fn max_cached_sessions(mut self, sessions: usize) -> Self {
        self.max_cached_sessions = sessions;
        self
    }

    /// Deadline for TCP connect plus TLS handshake.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Build the context.
    pub fn build(self) -> Context {
        let connector = Arc::new(TlsConnector::new(ConnectorOptions {
            alpn_protocols: self.alpn_protocols.clone(),
            reject_unauthorized: self.reject_unauthorized,
            max_cached_sessions: self.max_cached_sessions,
            connect_timeout: self.connect_timeout,
        }));
        let pool = Arc::new(H1Pool::new(self.h1));
        let h1 = H1Transport::new(Arc::clone(&pool), Arc::clone(&connector));
        let h2 = H2Transport::new(Arc::clone(&connector), self.h2);

        Context {
            inner: Arc::new(ContextInner {
                user_agent: self.user_agent,
                overwrite_user_agent: self.overwrite_user_agent,
                alpn_protocols: self.alpn_protocols,
                alpn_cache: AlpnCache::with_config(
                    self.alpn_cache_ttl,
                    self.alpn_cache_size,
                ),
                connector,
                pool,
                h1,
                h2,
            }),
        }
    }
}

struct ContextInner {
    user_agent: Option<String>,
    overwrite_user_agent: bool,
    alpn_protocols: Vec<AlpnProtocol>,
    alpn_cache: AlpnCache,
    connector: Arc<TlsConnector>,
    pool: Arc<H1Pool>,
    h1: H1Transport,
    h2: H2Transport,
}

/// An isolated HTTP client.
///
/// Cloning a context is cheap and shares the same caches and pools; use
/// [`Context::new`] or [`Context::builder`] for an independent one.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// A context with default options.
    pub fn new() -> Self {
        ContextBuilder::default().build()
    }

    /// Start building a context.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Issue a request: negotiate a protocol, reuse connections, stream
    /// and transparently decode the response body, follow redirects per
    /// the request's redirect mode.
    pub async fn fetch(
        &self,
        url: impl AsRef<str>,
        options: RequestOptions,
    ) -> Result<Response> {
        crate::fetch::fetch(self, url.as_ref(), options).await
    }

    /// Tear down everything this context owns: close pooled sockets and
    /// HTTP/2 sessions, clear the ALPN cache. Safe to call repeatedly and
    /// while requests are in flight (those either complete or fail with a
    /// cancellation error); a subsequent request re-establishes
    /// connections from scratch.
    pub async fn reset(&self) {
        self.inner.alpn_cache.clear();
        self.inner.pool.clear();
        self.inner.h2.shutdown().await;
    }

    pub(crate) fn user_agent(&self) -> Option<&str> {
        self.inner.user_agent.as_deref()
    }

    pub(crate) fn overwrite_user_agent(&self) -> bool {
        self.inner.overwrite_user_agent
    }

    pub(crate) fn alpn_protocols(&self) -> &[AlpnProtocol] {
        &self.inner.alpn_protocols
    }

    pub(crate) fn alpn_cache(&self) -> &AlpnCache {
        &self.inner.alpn_cache
    }

    pub(crate) fn connector(&self) -> &Arc<TlsConnector> {
        &self.inner.connector
    }

    pub(crate) fn h1(&self) -> &H1Transport {
        &self.inner.h1
    }

    pub(crate) fn h2(&self) -> &H2Transport {
        &self.inner.h2
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("user_agent", &self.inner.user_agent)
            .field("alpn_protocols", &self.inner.alpn_protocols)
            .finish()
    }
}
