//! # polyglot-fetch
//!
//! Transparent HTTP client for HTTP/1.0, HTTP/1.1, and HTTP/2.
//!
//! The caller issues a logical request; the client selects a wire
//! protocol via ALPN (cached per origin), reuses persistent connections
//! (a keep-alive HTTP/1 pool and a per-origin HTTP/2 session cache),
//! streams the response body with transparent content decoding, and
//! applies Fetch-style redirect and cancellation semantics.
//!
//! ```no_run
//! use polyglot_fetch::{fetch, RequestOptions};
//!
//! # async fn example() -> polyglot_fetch::Result<()> {
//! let mut response = fetch("https://example.com/", RequestOptions::new()).await?;
//! println!("{} via HTTP/{}", response.status, response.http_version());
//! let body = response.text().await?;
//! # Ok(())
//! # }
//! ```

// Core modules
pub mod abort;
pub mod alpn;
pub mod body;
pub mod context;
pub mod error;
pub mod request;
pub mod response;

// Internal plumbing
mod decoder;
mod dispatch;
mod fetch;

// Transport layer
pub mod transport;

// Connection pooling
pub mod pool;

// Re-exports for convenient access
pub use abort::{AbortController, AbortSignal};
pub use alpn::{
    AlpnCache, AlpnProtocol, Origin, ALPN_HTTP1_0, ALPN_HTTP1_1, ALPN_HTTP2, ALPN_HTTP2C,
};
pub use body::Body;
pub use context::{Context, ContextBuilder, DEFAULT_USER_AGENT};
pub use error::{Error, Result};
pub use pool::h1::{H1Options, Scheduling};
pub use request::{RedirectMode, RequestBody, RequestOptions};
pub use response::Response;
pub use transport::h2::{H2Options, PushHandler, PushPromiseHandler, PushedResponse};

use std::sync::OnceLock;

static DEFAULT_CONTEXT: OnceLock<Context> = OnceLock::new();

/// The process-wide default context, created on first use.
fn default_context() -> &'static Context {
    DEFAULT_CONTEXT.get_or_init(Context::new)
}

/// Issue a request through the process-wide default context.
///
/// Prefer an explicit [`Context`] when isolation of caches and pools
/// matters; this is a convenience for the common case.
pub async fn fetch(url: impl AsRef<str>, options: RequestOptions) -> Result<Response> {
    default_context().fetch(url, options).await
}

/// Reset the process-wide default context: close its connections and
/// sessions and clear its caches.
pub async fn reset() {
    default_context().reset().await
}
