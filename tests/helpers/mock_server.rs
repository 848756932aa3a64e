//! Scriptable HTTP/1.1 mock server for integration tests.
//!
//! Handles keep-alive connections: each accepted connection serves
//! requests until the client closes, the responder script says
//! `Connection: close`, or the read times out.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// One parsed request as the server saw it.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ReceivedRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

type Responder = Arc<dyn Fn(&ReceivedRequest) -> Vec<u8> + Send + Sync>;

/// A mock HTTP/1.1 server driven by a responder script.
pub struct MockServer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
}

impl MockServer {
    /// Bind to a random loopback port and serve with the given script.
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&ReceivedRequest) -> Vec<u8> + Send + Sync + 'static,
    {
        Self::start_with_delay(None, respond).await
    }

    /// Like [`MockServer::start`], but stall for `delay` before each
    /// response. Used by abort and timeout tests.
    pub async fn start_with_delay<F>(delay: Option<Duration>, respond: F) -> Self
    where
        F: Fn(&ReceivedRequest) -> Vec<u8> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let respond: Responder = Arc::new(respond);
        {
            let connections = Arc::clone(&connections);
            let requests = Arc::clone(&requests);
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    let respond = Arc::clone(&respond);
                    let requests = Arc::clone(&requests);
                    tokio::spawn(handle_connection(stream, respond, requests, delay));
                }
            });
        }

        Self {
            addr,
            connections,
            requests,
        }
    }

    /// Base URL using the `http:` scheme.
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.addr.port())
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of TCP connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Number of requests parsed so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Copy of every request seen so far, in order.
    pub fn requests(&self) -> Vec<ReceivedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    respond: Responder,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    delay: Option<Duration>,
) {
    let mut buffer: Vec<u8> = Vec::new();
    loop {
        let request = match read_request(&mut stream, &mut buffer).await {
            Some(request) => request,
            None => break,
        };
        requests.lock().unwrap().push(request.clone());

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let response = respond(&request);
        let close = response_says_close(&response);
        if stream.write_all(&response).await.is_err() {
            break;
        }
        let _ = stream.flush().await;
        if close {
            break;
        }
    }
}

/// Read one request (head + content-length body). Returns `None` on
/// close or timeout.
async fn read_request(stream: &mut TcpStream, buffer: &mut Vec<u8>) -> Option<ReceivedRequest> {
    let head_end = loop {
        if let Some(pos) = find_subsequence(buffer, b"\r\n\r\n") {
            break pos + 4;
        }
        let mut read_buf = [0u8; 8192];
        let n = match timeout(Duration::from_secs(5), stream.read(&mut read_buf)).await {
            Ok(Ok(n)) => n,
            _ => return None,
        };
        if n == 0 {
            return None;
        }
        buffer.extend_from_slice(&read_buf[..n]);
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split(' ');
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    let is_chunked = headers
        .iter()
        .any(|(k, v)| {
            k.eq_ignore_ascii_case("transfer-encoding")
                && v.to_ascii_lowercase().contains("chunked")
        });

    let mut rest = buffer[head_end..].to_vec();
    let body = if is_chunked {
        match read_chunked(stream, &mut rest).await {
            Some(body) => body,
            None => return None,
        }
    } else {
        let content_length = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(0);
        while rest.len() < content_length {
            let mut read_buf = [0u8; 8192];
            let n = match timeout(Duration::from_secs(5), stream.read(&mut read_buf)).await
            {
                Ok(Ok(n)) => n,
                _ => return None,
            };
            if n == 0 {
                return None;
            }
            rest.extend_from_slice(&read_buf[..n]);
        }
        let body = rest[..content_length].to_vec();
        rest.drain(..content_length);
        body
    };
    *buffer = rest;

    Some(ReceivedRequest {
        method,
        path,
        headers,
        body,
    })
}

/// Consume a chunked request body from `rest` (reading more as needed),
/// leaving any following pipelined bytes in place.
async fn read_chunked(stream: &mut TcpStream, rest: &mut Vec<u8>) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let (size, line_end) = loop {
            if let Some(pos) = find_subsequence(rest, b"\r\n") {
                let line = String::from_utf8_lossy(&rest[..pos]).to_string();
                let size = usize::from_str_radix(line.split(';').next()?.trim(), 16).ok()?;
                break (size, pos + 2);
            }
            let mut read_buf = [0u8; 8192];
            let n = match timeout(Duration::from_secs(5), stream.read(&mut read_buf)).await
            {
                Ok(Ok(n)) if n > 0 => n,
                _ => return None,
            };
            rest.extend_from_slice(&read_buf[..n]);
        };
        rest.drain(..line_end);

        // chunk data + CRLF; the zero chunk is followed by the final CRLF.
        let needed = if size == 0 { 2 } else { size + 2 };
        while rest.len() < needed {
            let mut read_buf = [0u8; 8192];
            let n = match timeout(Duration::from_secs(5), stream.read(&mut read_buf)).await
            {
                Ok(Ok(n)) if n > 0 => n,
                _ => return None,
            };
            rest.extend_from_slice(&read_buf[..n]);
        }
        if size == 0 {
            rest.drain(..2);
            return Some(body);
        }
        body.extend_from_slice(&rest[..size]);
        rest.drain(..needed);
    }
}

fn response_says_close(response: &[u8]) -> bool {
    let head_end = find_subsequence(response, b"\r\n\r\n").unwrap_or(response.len());
    String::from_utf8_lossy(&response[..head_end])
        .to_ascii_lowercase()
        .contains("connection: close")
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Build a plain response with a content-length body.
pub fn text_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    )
    .into_bytes()
}

/// Build a redirect response.
pub fn redirect_response(status: u16, location: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} Redirect\r\nlocation: {}\r\ncontent-length: 0\r\n\r\n",
        status, location
    )
    .into_bytes()
}
