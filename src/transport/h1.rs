//! HTTP/1.x transport.
//!
//! Issues one RFC 9112 request over either a pre-negotiated socket (the
//! ALPN handoff path) or a pooled keep-alive connection, and returns a
//! response whose body is streamed by a reader task. On clean body
//! completion the connection goes back to the pool; an error or abort
//! destroys it.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::abort::AbortSignal;
use crate::alpn::Origin;
use crate::body::{Body, BodySender};
use crate::error::{Error, Result};
use crate::pool::h1::{H1Pool, Lease};
use crate::request::Payload;
use crate::response::Response;
use crate::transport::connector::{MaybeTlsStream, TlsConnector};
use crate::transport::TransportRequest;

/// Maximum response head size (64KB).
const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// Maximum number of headers to parse.
const MAX_HEADERS_COUNT: usize = 100;

/// Read buffer size for head and body reads.
const READ_BUF_SIZE: usize = 8192;

/// HTTP/1.x transport bound to one context's pool and connector.
pub struct H1Transport {
    pool: Arc<H1Pool>,
    connector: Arc<TlsConnector>,
}

impl H1Transport {
    pub fn new(pool: Arc<H1Pool>, connector: Arc<TlsConnector>) -> Self {
        Self { pool, connector }
    }

    /// The pool backing this transport.
    pub fn pool(&self) -> &Arc<H1Pool> {
        &self.pool
    }

    /// Send one request. `handoff` carries a socket whose TLS handshake
    /// already happened during ALPN negotiation; it is used for exactly
    /// this request and billed against the pool.
    pub(crate) async fn request(
        &self,
        req: TransportRequest,
        handoff: Option<MaybeTlsStream>,
    ) -> Result<Response> {
        let origin = Origin::of(&req.url);

        let (lease, stream) = match handoff {
            Some(stream) => (self.pool.register(&origin), stream),
            None => {
                let (lease, idle) = match &req.signal {
                    Some(signal) => tokio::select! {
                        _ = signal.cancelled() => return Err(Error::Abort),
                        acquired = self.pool.acquire(&origin) => acquired,
                    },
                    None => self.pool.acquire(&origin).await,
                };
                match idle {
                    Some(stream) => (lease, stream),
                    None => {
                        // Protocol is already decided; offer only HTTP/1.x.
                        let alpn = [
                            crate::alpn::AlpnProtocol::Http11,
                            crate::alpn::AlpnProtocol::Http10,
                        ];
                        match self.connector.connect(&origin, None, Some(&alpn)).await {
                            Ok(stream) => (lease, stream),
                            Err(e) => {
                                self.pool.discard(lease);
                                return Err(e);
                            }
                        }
                    }
                }
            }
        };

        self.exchange(origin, lease, stream, req).await
    }

    async fn exchange(
        &self,
        origin: Origin,
        lease: Lease,
        mut stream: MaybeTlsStream,
        req: TransportRequest,
    ) -> Result<Response> {
        let signal = req.signal.clone();
        let keep_alive = self.pool.options().keep_alive;
        let mut req = req;
        let io = async {
            write_request(&mut stream, &mut req, keep_alive).await?;
            read_head(&mut stream).await
        };

        let head = match &signal {
            Some(signal) => tokio::select! {
                _ = signal.cancelled() => {
                    // Socket state is unknown mid-exchange; never pool it.
                    self.pool.discard(lease);
                    return Err(Error::Abort);
                }
                head = io => head,
            },
            None => io.await,
        };
        let head = match head {
            Ok(head) => head,
            Err(e) => {
                self.pool.discard(lease);
                return Err(e);
            }
        };

        let mut should_close = !self.pool.options().keep_alive;
        if let Some(conn) = head.headers.get(CONNECTION).and_then(|v| v.to_str().ok()) {
            if conn.to_ascii_lowercase().contains("close") {
                should_close = true;
            }
        }

        let framing = response_framing(&req.method, head.status, &head.headers)?;

        if matches!(framing, BodyFraming::None) {
            self.pool.checkin(lease, stream, !should_close);
            return Ok(Response::new(
                head.status,
                head.version,
                head.headers,
                Body::empty(),
            ));
        }

        let (tx, body) = Body::channel();
        let pool = Arc::clone(&self.pool);
        tokio::spawn(stream_body(
            stream,
            head.leftover,
            framing,
            tx,
            pool,
            lease,
            origin,
            should_close,
            signal,
        ));

        Ok(Response::new(head.status, head.version, head.headers, body))
    }
}

/// Serialize and send the request head and body.
///
/// Per RFC 9112 the request-target is origin-form; `Host` comes from the
/// normalized header map (the dispatcher guarantees it is present).
async fn write_request(
    stream: &mut MaybeTlsStream,
    req: &mut TransportRequest,
    keep_alive: bool,
) -> Result<()> {
    // A streamed payload is one-shot; take it out of the request.
    let payload = req.payload.take();
    let mut head = Vec::with_capacity(1024);

    head.extend_from_slice(req.method.as_str().as_bytes());
    head.push(b' ');
    let path = req.url.path();
    head.extend_from_slice(if path.is_empty() { "/" } else { path }.as_bytes());
    if let Some(query) = req.url.query() {
        head.push(b'?');
        head.extend_from_slice(query.as_bytes());
    }
    head.extend_from_slice(b" HTTP/1.1\r\n");

    let has_content_length = req.headers.contains_key(CONTENT_LENGTH);
    let has_transfer_encoding = req.headers.contains_key(TRANSFER_ENCODING);
    let mut chunked_payload = false;

    for (name, value) in &req.headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    if !req.headers.contains_key(CONNECTION) {
        head.extend_from_slice(if keep_alive {
            b"connection: keep-alive\r\n".as_slice()
        } else {
            b"connection: close\r\n".as_slice()
        });
    }

    match &payload {
        Some(Payload::Buffered(bytes)) => {
            // MUST NOT send Content-Length alongside Transfer-Encoding.
            if !has_content_length && !has_transfer_encoding {
                head.extend_from_slice(b"content-length: ");
                head.extend_from_slice(bytes.len().to_string().as_bytes());
                head.extend_from_slice(b"\r\n");
            }
        }
        Some(Payload::Streaming(_)) => {
            if !has_content_length && !has_transfer_encoding {
                head.extend_from_slice(b"transfer-encoding: chunked\r\n");
                chunked_payload = true;
            }
        }
        None => {}
    }

    head.extend_from_slice(b"\r\n");
    stream
        .write_all(&head)
        .await
        .map_err(|e| Error::protocol(format!("Failed to write request: {}", e)))?;

    match payload {
        Some(Payload::Buffered(bytes)) => {
            stream
                .write_all(&bytes)
                .await
                .map_err(|e| Error::protocol(format!("Failed to write body: {}", e)))?;
        }
        Some(Payload::Streaming(mut body)) => {
            while let Some(chunk) = body.chunk().await {
                let chunk = chunk?;
                if chunk.is_empty() {
                    continue;
                }
                if chunked_payload {
                    stream
                        .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
                        .await
                        .map_err(|e| Error::protocol(format!("Failed to write body: {}", e)))?;
                }
                stream
                    .write_all(&chunk)
                    .await
                    .map_err(|e| Error::protocol(format!("Failed to write body: {}", e)))?;
                if chunked_payload {
                    stream
                        .write_all(b"\r\n")
                        .await
                        .map_err(|e| Error::protocol(format!("Failed to write body: {}", e)))?;
                }
            }
            if chunked_payload {
                stream
                    .write_all(b"0\r\n\r\n")
                    .await
                    .map_err(|e| Error::protocol(format!("Failed to write body: {}", e)))?;
            }
        }
        None => {}
    }

    stream
        .flush()
        .await
        .map_err(|e| Error::protocol(format!("Failed to flush: {}", e)))?;
    Ok(())
}

struct Head {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    leftover: Vec<u8>,
}

/// Read and parse the response head. 1xx informational responses are
/// consumed until a final response arrives (RFC 9112 Section 6).
async fn read_head(stream: &mut MaybeTlsStream) -> Result<Head> {
    let mut buffer: Vec<u8> = Vec::with_capacity(READ_BUF_SIZE);

    loop {
        let head_end = loop {
            if let Some(end) = find_header_end(&buffer) {
                break end;
            }
            if buffer.len() >= MAX_HEADERS_SIZE {
                return Err(Error::protocol("Response headers too large"));
            }
            let mut read_buf = vec![0u8; READ_BUF_SIZE];
            let n = stream
                .read(&mut read_buf)
                .await
                .map_err(|e| Error::protocol(format!("Failed to read response: {}", e)))?;
            if n == 0 {
                return Err(Error::protocol(
                    "Connection closed before response complete",
                ));
            }
            buffer.extend_from_slice(&read_buf[..n]);
        };

        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
        let mut parsed = httparse::Response::new(&mut raw_headers);
        let consumed = match parsed
            .parse(&buffer)
            .map_err(|e| Error::protocol(format!("Failed to parse response: {}", e)))?
        {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => {
                return Err(Error::protocol("Incomplete response headers"));
            }
        };
        debug_assert!(consumed <= head_end);

        let code = parsed
            .code
            .ok_or_else(|| Error::protocol("Missing status code"))?;
        let status = StatusCode::from_u16(code)
            .map_err(|_| Error::protocol(format!("Invalid status code: {}", code)))?;
        let version = match parsed.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let mut headers = HeaderMap::new();
        for h in parsed.headers.iter().filter(|h| !h.name.is_empty()) {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .map_err(|_| Error::protocol(format!("Invalid header name: {}", h.name)))?;
            let value = HeaderValue::from_bytes(h.value)
                .map_err(|_| Error::protocol(format!("Invalid value for header {}", h.name)))?;
            headers.append(name, value);
        }

        let leftover = buffer[consumed..].to_vec();

        if status.is_informational() {
            // 1xx has no body; the final response may already be buffered.
            buffer = leftover;
            continue;
        }

        return Ok(Head {
            status,
            version,
            headers,
            leftover,
        });
    }
}

/// How the response body is delimited (RFC 9112 Section 6.3).
#[derive(Debug)]
enum BodyFraming {
    None,
    ContentLength(usize),
    Chunked,
    /// Delimited by connection close.
    Close,
}

fn response_framing(
    method: &Method,
    status: StatusCode,
    headers: &HeaderMap,
) -> Result<BodyFraming> {
    // HEAD responses and 1xx/204/304 never carry a body.
    if *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyFraming::None);
    }

    if let Some(te) = headers.get(TRANSFER_ENCODING).and_then(|v| v.to_str().ok()) {
        // chunked must be the final transfer coding.
        let is_chunked = te
            .split(',')
            .next_back()
            .map(|s| s.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false);
        return Ok(if is_chunked {
            BodyFraming::Chunked
        } else {
            BodyFraming::Close
        });
    }

    if let Some(cl) = headers.get(CONTENT_LENGTH).and_then(|v| v.to_str().ok()) {
        let len = parse_content_length(cl)?;
        return Ok(if len == 0 {
            BodyFraming::None
        } else {
            BodyFraming::ContentLength(len)
        });
    }

    Ok(BodyFraming::Close)
}

/// Reader task: stream the body per framing, then settle the lease.
#[allow(clippy::too_many_arguments)]
async fn stream_body(
    mut stream: MaybeTlsStream,
    leftover: Vec<u8>,
    framing: BodyFraming,
    tx: BodySender,
    pool: Arc<H1Pool>,
    lease: Lease,
    origin: Origin,
    should_close: bool,
    signal: Option<AbortSignal>,
) {
    let read = read_body(&mut stream, leftover, &framing, &tx);
    let outcome = match &signal {
        Some(signal) => tokio::select! {
            _ = signal.cancelled() => Err(Error::Abort),
            outcome = read => outcome,
        },
        None => read.await,
    };

    match outcome {
        Ok(reusable) => {
            tracing::debug!(%origin, reusable, "response body complete");
            pool.checkin(lease, stream, reusable && !should_close);
        }
        Err(e) => {
            tracing::debug!(%origin, error = %e, "response body terminated");
            tx.error(e).await;
            // The socket is mid-message; it must not be reused.
            pool.discard(lease);
        }
    }
}

/// Stream the body. Returns whether the connection is position-clean
/// (fully consumed message) and thus reusable.
async fn read_body(
    stream: &mut MaybeTlsStream,
    leftover: Vec<u8>,
    framing: &BodyFraming,
    tx: &BodySender,
) -> Result<bool> {
    match framing {
        BodyFraming::None => Ok(true),
        BodyFraming::ContentLength(len) => {
            read_fixed_body(stream, leftover, *len, tx).await
        }
        BodyFraming::Chunked => read_chunked_body(stream, leftover, tx).await,
        BodyFraming::Close => read_until_close(stream, leftover, tx).await,
    }
}

async fn forward(tx: &BodySender, chunk: Bytes) -> Result<()> {
    if chunk.is_empty() {
        return Ok(());
    }
    if !tx.send(chunk).await {
        // Reader dropped the body: treat as cancellation.
        return Err(Error::Abort);
    }
    Ok(())
}

/// Fixed-length body. A close before `content_length` bytes is an
/// incomplete message (RFC 9112 Section 6.3).
async fn read_fixed_body(
    stream: &mut MaybeTlsStream,
    leftover: Vec<u8>,
    content_length: usize,
    tx: &BodySender,
) -> Result<bool> {
    let mut received = leftover.len().min(content_length);
    forward(tx, Bytes::from(leftover[..received].to_vec())).await?;

    while received < content_length {
        let mut chunk = vec![0u8; (content_length - received).min(READ_BUF_SIZE)];
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| Error::protocol(format!("Failed to read body: {}", e)))?;
        if n == 0 {
            return Err(Error::protocol(format!(
                "Connection closed before receiving full body (got {} of {} bytes)",
                received, content_length
            )));
        }
        received += n;
        chunk.truncate(n);
        forward(tx, Bytes::from(chunk)).await?;
    }
    Ok(true)
}

async fn read_until_close(
    stream: &mut MaybeTlsStream,
    leftover: Vec<u8>,
    tx: &BodySender,
) -> Result<bool> {
    forward(tx, Bytes::from(leftover)).await?;
    loop {
        let mut chunk = vec![0u8; READ_BUF_SIZE];
        let n = stream.read(&mut chunk).await.map_err(|e| {
            Error::protocol(format!("Failed to read body (close-delimited): {}", e))
        })?;
        if n == 0 {
            // EOF is the message delimiter here; the connection is spent.
            return Ok(false);
        }
        chunk.truncate(n);
        forward(tx, Bytes::from(chunk)).await?;
    }
}

/// Chunked body per RFC 9112 Section 7.1:
/// chunked-body = *chunk last-chunk trailer-section CRLF
async fn read_chunked_body(
    stream: &mut MaybeTlsStream,
    leftover: Vec<u8>,
    tx: &BodySender,
) -> Result<bool> {
    let mut buffer = leftover;
    let mut read_buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let (chunk_size, line_end) = loop {
            if let Some((size, end)) = find_chunk_size(&buffer) {
                break (size, end);
            }
            let n = stream
                .read(&mut read_buf)
                .await
                .map_err(|e| Error::protocol(format!("Failed to read chunk size: {}", e)))?;
            if n == 0 {
                return Err(Error::protocol(
                    "Connection closed while reading chunk size",
                ));
            }
            buffer.extend_from_slice(&read_buf[..n]);
        };

        buffer.drain(..line_end);

        if chunk_size == 0 {
            consume_trailers(stream, &mut buffer).await?;
            return Ok(true);
        }

        // chunk data + trailing CRLF
        let chunk_end = chunk_size + 2;
        while buffer.len() < chunk_end {
            let n = stream
                .read(&mut read_buf)
                .await
                .map_err(|e| Error::protocol(format!("Failed to read chunk data: {}", e)))?;
            if n == 0 {
                return Err(Error::protocol(
                    "Connection closed while reading chunk data",
                ));
            }
            buffer.extend_from_slice(&read_buf[..n]);
        }

        forward(tx, Bytes::from(buffer[..chunk_size].to_vec())).await?;
        buffer.drain(..chunk_end);
    }
}

/// Consume trailer headers after the last chunk; the section ends with an
/// empty line (RFC 9112 Section 7.1.2).
async fn consume_trailers(stream: &mut MaybeTlsStream, buffer: &mut Vec<u8>) -> Result<()> {
    let mut read_buf = vec![0u8; 4096];

    loop {
        if let Some(pos) = find_crlf(buffer) {
            if pos == 0 {
                buffer.drain(..2);
                return Ok(());
            }
            // Trailer field; skip it.
            buffer.drain(..pos + 2);
            continue;
        }

        let n = stream
            .read(&mut read_buf)
            .await
            .map_err(|e| Error::protocol(format!("Failed to read trailers: {}", e)))?;
        if n == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&read_buf[..n]);
    }
}

/// Find the end of HTTP headers (\r\n\r\n).
fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse a chunk size line, returning (size, end_of_line_position).
fn find_chunk_size(buffer: &[u8]) -> Option<(usize, usize)> {
    let pos = find_crlf(buffer)?;
    let line = &buffer[..pos];
    let size_str = std::str::from_utf8(line).ok()?;
    // Chunk extensions after ';' are ignored.
    let size_part = size_str.split(';').next()?;
    let size = usize::from_str_radix(size_part.trim(), 16).ok()?;
    Some((size, pos + 2))
}

/// Find the first CRLF in a buffer, returning its position.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

/// Parse and validate Content-Length per RFC 9112 Section 6.2: a
/// non-negative integer; multiple values must all be identical.
fn parse_content_length(value: &str) -> Result<usize> {
    let mut parts = value.split(',').map(|s| s.trim());
    let first = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::protocol("Empty Content-Length"))?
        .parse::<usize>()
        .map_err(|_| Error::protocol(format!("Invalid Content-Length: {}", value)))?;
    for part in parts {
        let val = part
            .parse::<usize>()
            .map_err(|_| Error::protocol(format!("Invalid Content-Length: {}", value)))?;
        if val != first {
            return Err(Error::protocol(format!(
                "Conflicting Content-Length values: {}",
                value
            )));
        }
    }
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_header_end() {
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(find_header_end(data), Some(38));

        let partial = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n";
        assert_eq!(find_header_end(partial), None);
    }

    #[test]
    fn test_find_chunk_size() {
        assert_eq!(find_chunk_size(b"5\r\nhello"), Some((5, 3)));
        assert_eq!(find_chunk_size(b"a\r\n0123456789"), Some((10, 3)));
        assert_eq!(find_chunk_size(b"0\r\n"), Some((0, 3)));
        assert_eq!(find_chunk_size(b"5;ext=val\r\ndata"), Some((5, 11)));
        assert_eq!(find_chunk_size(b"FF\r\n"), Some((255, 4)));
        assert_eq!(find_chunk_size(b"XYZ\r\n"), None);
        assert_eq!(find_chunk_size(b"10"), None);
    }

    #[test]
    fn test_find_crlf() {
        assert_eq!(find_crlf(b"\r\n"), Some(0));
        assert_eq!(find_crlf(b"hello\r\nworld"), Some(5));
        assert_eq!(find_crlf(b"no crlf here"), None);
        assert_eq!(find_crlf(b"\r"), None);
    }

    #[test]
    fn test_parse_content_length() {
        assert_eq!(parse_content_length("0").unwrap(), 0);
        assert_eq!(parse_content_length("100").unwrap(), 100);
        // Multiple identical values are allowed.
        assert_eq!(parse_content_length("100, 100").unwrap(), 100);
        // Conflicting values are an error.
        assert!(parse_content_length("100, 200").is_err());
        assert!(parse_content_length("abc").is_err());
        assert!(parse_content_length("-1").is_err());
        assert!(parse_content_length("").is_err());
    }

    #[test]
    fn test_framing_bodiless_statuses() {
        let h = HeaderMap::new();
        for status in [100, 101, 204, 304] {
            let framing = response_framing(
                &Method::GET,
                StatusCode::from_u16(status).unwrap(),
                &h,
            )
            .unwrap();
            assert!(matches!(framing, BodyFraming::None), "status {}", status);
        }
    }

    #[test]
    fn test_framing_head_request() {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_LENGTH, HeaderValue::from_static("100"));
        let framing = response_framing(&Method::HEAD, StatusCode::OK, &h).unwrap();
        assert!(matches!(framing, BodyFraming::None));
    }

    #[test]
    fn test_framing_transfer_encoding_overrides_content_length() {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_LENGTH, HeaderValue::from_static("100"));
        h.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        let framing = response_framing(&Method::GET, StatusCode::OK, &h).unwrap();
        assert!(matches!(framing, BodyFraming::Chunked));
    }

    #[test]
    fn test_framing_non_chunked_transfer_encoding_reads_to_close() {
        let mut h = HeaderMap::new();
        h.insert(TRANSFER_ENCODING, HeaderValue::from_static("gzip"));
        let framing = response_framing(&Method::GET, StatusCode::OK, &h).unwrap();
        assert!(matches!(framing, BodyFraming::Close));
    }

    #[test]
    fn test_framing_no_length_reads_to_close() {
        let framing =
            response_framing(&Method::GET, StatusCode::OK, &HeaderMap::new()).unwrap();
        assert!(matches!(framing, BodyFraming::Close));
    }
}
