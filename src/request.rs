//! Logical request options.
//!
//! A request is immutable once dispatched; the redirect layer constructs
//! a fresh set of options for every hop.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};

use crate::abort::AbortSignal;
use crate::body::Body;

/// How 3xx responses are handled, per the Fetch standard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectMode {
    /// Follow redirects up to the `follow` limit.
    #[default]
    Follow,
    /// Return the 3xx response with `location` resolved to an absolute URL.
    Manual,
    /// Fail on any redirect.
    Error,
}

/// The shapes a request body can take.
#[derive(Debug)]
pub enum RequestBody {
    /// Raw bytes; no implicit content-type.
    Bytes(Bytes),
    /// Text; hints `text/plain;charset=UTF-8`.
    Text(String),
    /// A JSON value; hints `application/json`.
    Json(serde_json::Value),
    /// URL-encoded form pairs; hints
    /// `application/x-www-form-urlencoded;charset=UTF-8`.
    Form(Vec<(String, String)>),
    /// A byte stream. Cannot be replayed across redirects.
    Stream(Body),
}

impl RequestBody {
    /// Whether this body is a one-shot stream.
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }
}

impl From<Bytes> for RequestBody {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<&'static [u8]> for RequestBody {
    fn from(b: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(b))
    }
}

impl From<String> for RequestBody {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for RequestBody {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<serde_json::Value> for RequestBody {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl From<Body> for RequestBody {
    fn from(b: Body) -> Self {
        Self::Stream(b)
    }
}

/// Options for a single logical request.
#[derive(Debug, Default)]
pub struct RequestOptions {
    /// Request method; defaults to GET, uppercased at dispatch.
    pub method: Method,
    /// Header map; names are lowercased by construction.
    pub headers: HeaderMap,
    /// Request body, if any.
    pub body: Option<RequestBody>,
    /// Redirect mode; defaults to `Follow`.
    pub redirect: RedirectMode,
    /// Maximum number of redirects to follow; 0 disallows any.
    pub follow: Option<u32>,
    /// Ask for and transparently decode compressed responses.
    pub compress: Option<bool>,
    /// Cancellation signal.
    pub signal: Option<AbortSignal>,
    /// Absolute deadline for the whole request, redirects included.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    /// Default redirect follow limit.
    pub const DEFAULT_FOLLOW: u32 = 20;

    /// Fresh options: GET, no headers, follow redirects, compress.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Append a header. Invalid names or values are ignored.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// Replace all headers.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set a JSON body from any serializable value.
    pub fn json<T: serde::Serialize>(mut self, value: &T) -> crate::Result<Self> {
        self.body = Some(RequestBody::Json(serde_json::to_value(value)?));
        Ok(self)
    }

    /// Set a URL-encoded form body.
    pub fn form<K, V>(mut self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.body = Some(RequestBody::Form(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ));
        self
    }

    /// Set the redirect mode.
    pub fn redirect(mut self, mode: RedirectMode) -> Self {
        self.redirect = mode;
        self
    }

    /// Set the redirect follow limit (0 disallows redirects).
    pub fn follow(mut self, follow: u32) -> Self {
        self.follow = Some(follow);
        self
    }

    /// Enable or disable transparent compression.
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }

    /// Attach a cancellation signal.
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Set an absolute deadline for the request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Wire-ready request body after normalization.
#[derive(Debug)]
pub(crate) enum Payload {
    Buffered(Bytes),
    Streaming(Body),
}
