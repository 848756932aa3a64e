//! Error types for the polyglot-fetch crate.

use std::io;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during HTTP operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unsupported scheme or nonsensical options.
    #[error("Configuration error: {0}")]
    Config(String),

    /// TCP connect or DNS failure.
    #[error("Connection error: {0}")]
    Connect(String),

    /// TLS handshake or certificate verification failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP protocol violation: GOAWAY with error code, frame error,
    /// malformed response.
    #[error("HTTP protocol error: {0}")]
    Protocol(String),

    /// The request was cancelled via its abort signal.
    #[error("The operation was aborted")]
    Abort,

    /// A redirect was received while redirect mode is `error`.
    #[error("Redirect not allowed: {0}")]
    NoRedirect(String),

    /// Redirect limit exceeded.
    #[error("Maximum redirect reached at: {url}")]
    MaxRedirect { url: String, count: u32 },

    /// Redirect of a request whose body stream has already been consumed.
    #[error("Cannot follow redirect with body being a readable stream: {0}")]
    UnsupportedRedirect(String),

    /// The `location` header did not resolve to a valid URL.
    #[error("Invalid redirect URL: {0}")]
    InvalidRedirectUrl(String),

    /// Content decoding (gzip/deflate/br/zstd) failure.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Operation timed out.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The response body was already consumed.
    #[error("Body already consumed")]
    BodyConsumed,

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error surfaced from the underlying socket layer.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a connection error.
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect(message.into())
    }

    /// Create a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls(message.into())
    }

    /// Create an HTTP protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Whether this error represents voluntary cancellation, so callers
    /// can distinguish an abort from a transport failure.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort)
    }

    /// Whether this error came out of the redirect state machine.
    pub fn is_redirect(&self) -> bool {
        matches!(
            self,
            Self::NoRedirect(_)
                | Self::MaxRedirect { .. }
                | Self::UnsupportedRedirect(_)
                | Self::InvalidRedirectUrl(_)
        )
    }
}

impl From<h2::Error> for Error {
    fn from(e: h2::Error) -> Self {
        if e.is_io() {
            return Self::Connect(e.to_string());
        }
        Self::Protocol(e.to_string())
    }
}
