//! Request normalization and protocol selection.
//!
//! The dispatcher turns a logical request into a wire request: method
//! case, default headers, body coercion hints, then ALPN-driven protocol
//! selection. A cache miss on `https:` performs TLS+ALPN under the
//! per-origin connect lock and hands the freshly negotiated socket to the
//! selected transport so it is not wasted.

use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, CONTENT_TYPE, HOST, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method};
use url::Url;

use crate::abort::AbortSignal;
use crate::alpn::{AlpnProtocol, Origin};
use crate::context::Context;
use crate::decoder::decode;
use crate::error::{Error, Result};
use crate::request::{Payload, RequestBody};
use crate::response::Response;
use crate::transport::connector::MaybeTlsStream;
use crate::transport::TransportRequest;

/// Dispatch one normalized hop: pick a protocol, run the transport, wrap
/// the body with the content decoder.
///
/// `body` is shared with the redirect loop: buffered shapes are cloned
/// per hop so they can replay; a stream body is taken and cannot.
pub(crate) async fn dispatch(
    ctx: &Context,
    url: &Url,
    method: &Method,
    mut headers: HeaderMap,
    body: &mut Option<RequestBody>,
    compress: bool,
    signal: Option<AbortSignal>,
) -> Result<Response> {
    if let Some(signal) = &signal {
        if signal.aborted() {
            return Err(Error::Abort);
        }
    }

    let method = normalize_method(method)?;

    if !headers.contains_key(HOST) {
        if let Some(value) = host_header(url) {
            headers.insert(HOST, value);
        }
    }

    if let Some(ua) = ctx.user_agent() {
        if ctx.overwrite_user_agent() || !headers.contains_key(USER_AGENT) {
            if let Ok(value) = HeaderValue::from_str(ua) {
                headers.insert(USER_AGENT, value);
            }
        }
    }

    let payload = coerce_body(body, &mut headers)?;

    if compress && !headers.contains_key(ACCEPT_ENCODING) {
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip,deflate,br"));
    }

    let (url, protocol, handoff) = select_protocol(ctx, url, &signal).await?;

    let request = TransportRequest {
        url: url.clone(),
        method,
        headers,
        payload,
        signal,
    };

    let mut response = match protocol {
        AlpnProtocol::H2 | AlpnProtocol::H2c => ctx.h2().request(request, handoff).await?,
        AlpnProtocol::Http11 | AlpnProtocol::Http10 => {
            ctx.h1().request(request, handoff).await?
        }
    };

    let raw = std::mem::take(response.body_mut());
    *response.body_mut() = decode(response.status, &response.headers, raw);
    Ok(response)
}

/// Pick the protocol for a URL via the ALPN cache, negotiating on a
/// `https:` miss. Non-TLS schemes seed the cache synthetically.
async fn select_protocol(
    ctx: &Context,
    url: &Url,
    signal: &Option<AbortSignal>,
) -> Result<(Url, AlpnProtocol, Option<MaybeTlsStream>)> {
    let origin = Origin::of(url);
    match url.scheme() {
        "http" => {
            ctx.alpn_cache().set(origin, AlpnProtocol::Http11);
            Ok((url.clone(), AlpnProtocol::Http11, None))
        }
        "http2" => {
            ctx.alpn_cache().set(origin, AlpnProtocol::H2c);
            // The h2c transport speaks plain-text HTTP/2 over an `http:`
            // URL; `http2:` only forces the protocol choice.
            let rewritten = Url::parse(&url.as_str().replacen("http2://", "http://", 1))
                .map_err(|e| Error::config(format!("Invalid h2c URL: {}", e)))?;
            Ok((rewritten, AlpnProtocol::H2c, None))
        }
        "https" => {
            if let Some(protocol) = ctx.alpn_cache().get(&origin) {
                return Ok((url.clone(), protocol, None));
            }

            // Serialize handshakes per origin so N parallel first
            // requests negotiate once and share the outcome.
            let lock = ctx.connector().origin_lock(&origin);
            let guard = match signal {
                Some(signal) => tokio::select! {
                    _ = signal.cancelled() => return Err(Error::Abort),
                    guard = lock.lock() => guard,
                },
                None => lock.lock().await,
            };

            // The lock winner may have populated the cache meanwhile.
            if let Some(protocol) = ctx.alpn_cache().get(&origin) {
                drop(guard);
                return Ok((url.clone(), protocol, None));
            }

            let connect = ctx
                .connector()
                .connect(&origin, None, Some(ctx.alpn_protocols()));
            let stream = match signal {
                Some(signal) => tokio::select! {
                    _ = signal.cancelled() => return Err(Error::Abort),
                    stream = connect => stream?,
                },
                None => connect.await?,
            };

            // No ALPN from the peer means HTTP/1.1.
            let protocol = stream.alpn_protocol().unwrap_or(AlpnProtocol::Http11);
            ctx.alpn_cache().set(origin, protocol);
            drop(guard);

            Ok((url.clone(), protocol, Some(stream)))
        }
        other => Err(Error::config(format!("Unsupported scheme: {}", other))),
    }
}

/// Uppercase the method; standard methods are already canonical.
fn normalize_method(method: &Method) -> Result<Method> {
    let s = method.as_str();
    if s.bytes().any(|b| b.is_ascii_lowercase()) {
        Method::from_bytes(s.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::config(format!("Invalid method: {}", s)))
    } else {
        Ok(method.clone())
    }
}

fn host_header(url: &Url) -> Option<HeaderValue> {
    let host = url.host_str()?;
    // `Url::port` is None for the scheme default port.
    let value = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    HeaderValue::from_str(&value).ok()
}

/// Coerce the body shape into a wire payload, hinting `content-type`
/// when none was given. Buffered shapes are cloned so redirects can
/// replay them; a stream is taken out and is gone.
fn coerce_body(
    body: &mut Option<RequestBody>,
    headers: &mut HeaderMap,
) -> Result<Option<Payload>> {
    let Some(shape) = body.as_ref() else {
        return Ok(None);
    };
    let has_content_type = headers.contains_key(CONTENT_TYPE);
    let mut hint = |value: &'static str| {
        if !has_content_type {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(value));
        }
    };

    let payload = match shape {
        RequestBody::Bytes(bytes) => Payload::Buffered(bytes.clone()),
        RequestBody::Text(text) => {
            hint("text/plain;charset=UTF-8");
            Payload::Buffered(Bytes::from(text.clone().into_bytes()))
        }
        RequestBody::Json(value) => {
            hint("application/json");
            Payload::Buffered(Bytes::from(serde_json::to_vec(value)?))
        }
        RequestBody::Form(pairs) => {
            hint("application/x-www-form-urlencoded;charset=UTF-8");
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            for (k, v) in pairs {
                serializer.append_pair(k, v);
            }
            Payload::Buffered(Bytes::from(serializer.finish().into_bytes()))
        }
        RequestBody::Stream(_) => match body.take() {
            Some(RequestBody::Stream(stream)) => Payload::Streaming(stream),
            _ => unreachable!(),
        },
    };
    Ok(Some(payload))
}
