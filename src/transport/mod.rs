//! Transport layer: TLS connector, HTTP/1.x and HTTP/2 transports.

pub mod connector;
pub mod h1;
pub mod h2;

use http::{HeaderMap, Method};
use url::Url;

use crate::abort::AbortSignal;
use crate::request::Payload;

/// A normalized request as the transports consume it: the dispatcher has
/// already applied header defaults, body coercion, and protocol selection.
#[derive(Debug)]
pub(crate) struct TransportRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub payload: Option<Payload>,
    pub signal: Option<AbortSignal>,
}
