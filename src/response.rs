//! Transport-form HTTP response.

use http::header::{CONTENT_TYPE, LOCATION};
use http::{HeaderMap, StatusCode, Version};
use url::Url;

use crate::body::Body;
use crate::error::Result;

/// An HTTP response: status, version, lowercased headers, and a body
/// stream that may be transparently decompressed.
///
/// The status line reason text is not carried; HTTP/2 has none.
#[derive(Debug)]
pub struct Response {
    /// Response status code.
    pub status: StatusCode,
    /// Lowercased response header map.
    pub headers: HeaderMap,
    /// The URL that produced this response, after redirects.
    pub effective_url: Option<Url>,
    version: Version,
    body: Body,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
        body: Body,
    ) -> Self {
        Self {
            status,
            headers,
            effective_url: None,
            version,
            body,
        }
    }

    /// Record the URL that was actually requested. Used by the redirect
    /// engine to track the final hop.
    pub fn with_url(mut self, url: Url) -> Self {
        self.effective_url = Some(url);
        self
    }

    /// The negotiated HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The HTTP version as a `major.minor` string: "1.0", "1.1", "2.0".
    pub fn http_version(&self) -> &'static str {
        match self.version {
            Version::HTTP_09 => "0.9",
            Version::HTTP_10 => "1.0",
            Version::HTTP_2 => "2.0",
            _ => "1.1",
        }
    }

    /// Whether the status is in the 2xx range.
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Whether the status is in the 3xx range.
    pub fn is_redirect(&self) -> bool {
        self.status.is_redirection()
    }

    /// Get a header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The `location` header, if any.
    pub fn location(&self) -> Option<&str> {
        self.headers.get(LOCATION).and_then(|v| v.to_str().ok())
    }

    /// The `content-type` header, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Mutable access to the body stream.
    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    /// Take the body out of the response.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Buffer the entire body. One-shot; the body is disturbed afterwards.
    pub async fn bytes(&mut self) -> Result<bytes::Bytes> {
        self.body.bytes().await
    }

    /// Buffer the body and decode as UTF-8 text.
    pub async fn text(&mut self) -> Result<String> {
        self.body.text().await
    }

    /// Buffer the body and deserialize as JSON.
    pub async fn json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        self.body.json().await
    }
}
