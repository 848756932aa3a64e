//! Cleartext HTTP/2 mock server built on the h2 crate's server side.
//!
//! Clients reach it through the `http2:` URL scheme (prior-knowledge
//! h2c), which keeps TLS out of the test setup.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;

/// Responder script: (method, path, request body) → (status, response body).
type Responder = Arc<dyn Fn(&str, &str, &[u8]) -> (u16, Vec<u8>) + Send + Sync>;

/// A resource pushed alongside every response.
#[derive(Clone)]
pub struct PushSpec {
    pub path: &'static str,
    pub body: &'static [u8],
}

pub struct MockH2Server {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    requests: Arc<AtomicUsize>,
}

impl MockH2Server {
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&str, &str, &[u8]) -> (u16, Vec<u8>) + Send + Sync + 'static,
    {
        Self::start_inner(None, None, Arc::new(respond)).await
    }

    /// Push `push` on every request, then answer normally.
    pub async fn start_with_push<F>(push: PushSpec, respond: F) -> Self
    where
        F: Fn(&str, &str, &[u8]) -> (u16, Vec<u8>) + Send + Sync + 'static,
    {
        Self::start_inner(Some(push), None, Arc::new(respond)).await
    }

    /// Stall for `delay` before answering. Used by abort tests.
    pub async fn start_with_delay<F>(delay: Duration, respond: F) -> Self
    where
        F: Fn(&str, &str, &[u8]) -> (u16, Vec<u8>) + Send + Sync + 'static,
    {
        Self::start_inner(None, Some(delay), Arc::new(respond)).await
    }

    async fn start_inner(
        push: Option<PushSpec>,
        delay: Option<Duration>,
        respond: Responder,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));

        {
            let connections = Arc::clone(&connections);
            let requests = Arc::clone(&requests);
            tokio::spawn(async move {
                loop {
                    let Ok((tcp, _)) = listener.accept().await else {
                        break;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    let respond = Arc::clone(&respond);
                    let requests = Arc::clone(&requests);
                    let push = push.clone();
                    tokio::spawn(serve_connection(tcp, respond, requests, push, delay));
                }
            });
        }

        Self {
            addr,
            connections,
            requests,
        }
    }

    /// Base URL with the prior-knowledge h2c scheme.
    pub fn url(&self) -> String {
        format!("http2://127.0.0.1:{}", self.addr.port())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

async fn serve_connection(
    tcp: tokio::net::TcpStream,
    respond: Responder,
    requests: Arc<AtomicUsize>,
    push: Option<PushSpec>,
    delay: Option<Duration>,
) {
    let mut connection = match h2::server::handshake(tcp).await {
        Ok(connection) => connection,
        Err(_) => return,
    };

    while let Some(accepted) = connection.accept().await {
        let Ok((request, respond_handle)) = accepted else {
            break;
        };
        requests.fetch_add(1, Ordering::SeqCst);
        let respond = Arc::clone(&respond);
        let push = push.clone();
        tokio::spawn(serve_stream(request, respond_handle, respond, push, delay));
    }
}

async fn serve_stream(
    request: http::Request<h2::RecvStream>,
    mut respond_handle: h2::server::SendResponse<Bytes>,
    respond: Responder,
    push: Option<PushSpec>,
    delay: Option<Duration>,
) {
    let (parts, mut recv) = request.into_parts();
    let mut body = Vec::new();
    while let Some(chunk) = recv.data().await {
        let Ok(chunk) = chunk else { return };
        let _ = recv.flow_control().release_capacity(chunk.len());
        body.extend_from_slice(&chunk);
    }

    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    // Push before the main response so the promise precedes stream end.
    if let Some(push) = push {
        let authority = parts
            .uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_default();
        let pushed_request = http::Request::builder()
            .method("GET")
            .uri(format!("http://{}{}", authority, push.path))
            .body(())
            .unwrap();
        match respond_handle.push_request(pushed_request) {
            Ok(mut pushed) => {
                let response = http::Response::builder()
                    .status(200)
                    .header("content-length", push.body.len())
                    .body(())
                    .unwrap();
                if let Ok(mut send) = pushed.send_response(response, false) {
                    let _ = send.send_data(Bytes::from_static(push.body), true);
                }
            }
            Err(e) => eprintln!("push refused: {}", e),
        }
    }

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let (status, response_body) = respond(parts.method.as_str(), path, &body);

    let response = http::Response::builder().status(status).body(()).unwrap();
    let end_of_stream = response_body.is_empty();
    match respond_handle.send_response(response, end_of_stream) {
        Ok(mut send) => {
            if !end_of_stream {
                let _ = send.send_data(Bytes::from(response_body), true);
            }
        }
        Err(e) => eprintln!("send_response failed: {}", e),
    }
}
