//! HTTP/2 transport.
//!
//! Keeps at most one multiplexed session per origin. A session is created
//! on the first h2/h2c request to an origin (optionally seeded from the
//! socket the ALPN handshake already produced), driven by a background
//! task, reaped by an idle watchdog, and evicted from the cache the
//! moment it closes. Server push is surfaced through registered handlers
//! with per-stream idle eviction.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use h2::client::{Builder, Connection, PushPromises, PushedResponseFuture, SendRequest};
use h2::RecvStream;
use http::header::HOST;
use http::{HeaderMap, Request, Uri, Version};
use tokio::sync::Notify;
use url::Url;

use crate::abort::AbortSignal;
use crate::alpn::{AlpnProtocol, Origin};
use crate::body::{Body, BodySender};
use crate::error::{Error, Result};
use crate::request::Payload;
use crate::response::Response;
use crate::transport::connector::{MaybeTlsStream, TlsConnector};
use crate::transport::TransportRequest;

/// Grace period a closing session gets for in-flight streams before its
/// driver is torn down regardless.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Handler consulted for every push promise before any body is
/// delivered; returning `false` rejects the pushed stream (it is reset
/// with CANCEL).
pub type PushPromiseHandler = Arc<dyn Fn(&Url, &HeaderMap) -> bool + Send + Sync>;

/// Handler receiving accepted pushed responses. The handler is
/// responsible for consuming the body; an unconsumed pushed stream is
/// evicted after the configured idle timeout.
pub type PushHandler = Arc<dyn Fn(PushedResponse) + Send + Sync>;

/// A server-initiated resource delivered via HTTP/2 push.
#[derive(Debug)]
pub struct PushedResponse {
    /// URL the server promised, derived from the push pseudo-headers.
    pub url: Url,
    /// Promised request method, almost always GET.
    pub method: http::Method,
    /// Request headers of the promise.
    pub request_headers: HeaderMap,
    /// The pushed response; its body streams from the pushed stream.
    pub response: Response,
}

/// HTTP/2 transport options.
#[derive(Clone, Default)]
pub struct H2Options {
    /// Close a session after this long without active streams.
    /// `None` applies the 300 s default.
    pub idle_session_timeout: Option<Duration>,
    /// Evict an unconsumed pushed stream after this long.
    /// `None` applies the 5 s default.
    pub pushed_stream_idle_timeout: Option<Duration>,
    /// Accept/reject callback for push promises.
    pub push_promise_handler: Option<PushPromiseHandler>,
    /// Delivery callback for accepted pushes.
    pub push_handler: Option<PushHandler>,
}

impl H2Options {
    /// Default session idle timeout (300 s).
    pub const DEFAULT_IDLE_SESSION_TIMEOUT: Duration = Duration::from_secs(300);

    /// Default pushed-stream idle timeout (5 s).
    pub const DEFAULT_PUSHED_STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

    fn idle_session_timeout(&self) -> Duration {
        self.idle_session_timeout
            .unwrap_or(Self::DEFAULT_IDLE_SESSION_TIMEOUT)
    }

    fn pushed_stream_idle_timeout(&self) -> Duration {
        self.pushed_stream_idle_timeout
            .unwrap_or(Self::DEFAULT_PUSHED_STREAM_IDLE_TIMEOUT)
    }

    /// Push frames are only negotiated when someone is listening.
    fn push_enabled(&self) -> bool {
        self.push_promise_handler.is_some() || self.push_handler.is_some()
    }
}

impl fmt::Debug for H2Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("H2Options")
            .field("idle_session_timeout", &self.idle_session_timeout)
            .field(
                "pushed_stream_idle_timeout",
                &self.pushed_stream_idle_timeout,
            )
            .field("push_promise_handler", &self.push_promise_handler.is_some())
            .field("push_handler", &self.push_handler.is_some())
            .finish()
    }
}

struct SessionShared {
    origin: Origin,
    closed: AtomicBool,
    active_streams: AtomicUsize,
    last_used: StdMutex<Instant>,
    shutdown: Notify,
}

impl SessionShared {
    fn touch(&self) {
        *self.last_used.lock().expect("session clock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .expect("session clock poisoned")
            .elapsed()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
    }
}

/// Cheap handle onto one multiplexed session.
#[derive(Clone)]
struct H2Session {
    sender: SendRequest<Bytes>,
    shared: Arc<SessionShared>,
}

/// Decrements the session's active stream count when dropped; carried by
/// the request until the body pump takes over.
struct StreamGuard {
    shared: Arc<SessionShared>,
}

impl StreamGuard {
    fn new(shared: Arc<SessionShared>) -> Self {
        shared.active_streams.fetch_add(1, Ordering::AcqRel);
        shared.touch();
        Self { shared }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.shared.touch();
        self.shared.active_streams.fetch_sub(1, Ordering::AcqRel);
    }
}

type Slot = Arc<tokio::sync::Mutex<Option<H2Session>>>;

/// HTTP/2 transport bound to one context.
pub struct H2Transport {
    connector: Arc<TlsConnector>,
    options: H2Options,
    slots: StdMutex<HashMap<Origin, Slot>>,
}

impl H2Transport {
    pub fn new(connector: Arc<TlsConnector>, options: H2Options) -> Self {
        Self {
            connector,
            options,
            slots: StdMutex::new(HashMap::new()),
        }
    }

    /// Send one request over the origin's session, creating it if needed.
    pub(crate) async fn request(
        &self,
        req: TransportRequest,
        handoff: Option<MaybeTlsStream>,
    ) -> Result<Response> {
        let origin = Origin::of(&req.url);
        let signal = req.signal.clone();

        let acquire = self.session(&origin, handoff);
        let session = match &signal {
            Some(signal) => tokio::select! {
                _ = signal.cancelled() => return Err(Error::Abort),
                session = acquire => session?,
            },
            None => acquire.await?,
        };

        self.exchange(session, req).await
    }

    /// Number of live cached sessions.
    pub fn session_count(&self) -> usize {
        let slots = self.slots.lock().expect("session map poisoned");
        slots.len()
    }

    /// Close every cached session: wait out in-flight streams for a
    /// bounded grace period, then tear the drivers down regardless.
    pub async fn shutdown(&self) {
        let drained: Vec<Slot> = {
            let mut slots = self.slots.lock().expect("session map poisoned");
            slots.drain().map(|(_, slot)| slot).collect()
        };

        for slot in drained {
            let session = slot.lock().await.take();
            let Some(session) = session else { continue };
            let shared = session.shared;
            tracing::debug!(origin = %shared.origin, "closing session");

            let deadline = Instant::now() + CLOSE_GRACE;
            while shared.active_streams.load(Ordering::Acquire) > 0
                && Instant::now() < deadline
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            shared.close();
        }
    }

    fn slot(&self, origin: &Origin) -> Slot {
        let mut slots = self.slots.lock().expect("session map poisoned");
        Arc::clone(
            slots
                .entry(origin.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None))),
        )
    }

    /// Get the live session for an origin, or establish one. The
    /// per-origin slot lock guarantees two simultaneous first-requests
    /// end up multiplexed onto a single session.
    async fn session(
        &self,
        origin: &Origin,
        handoff: Option<MaybeTlsStream>,
    ) -> Result<H2Session> {
        let slot = self.slot(origin);
        let mut guard = slot.lock().await;

        if let Some(session) = guard.as_ref() {
            if !session.shared.is_closed() {
                if handoff.is_some() {
                    // A session appeared while the handshake ran; the
                    // handed-off socket is redundant.
                    tracing::debug!(%origin, "discarding redundant negotiated socket");
                }
                return Ok(session.clone());
            }
            // A closed session leaves the cache before its replacement
            // goes in.
            *guard = None;
        }

        let stream = match handoff {
            Some(stream) => stream,
            None => {
                let alpn = [AlpnProtocol::H2];
                self.connector.connect(origin, None, Some(&alpn)).await?
            }
        };

        let mut builder = Builder::new();
        builder.enable_push(self.options.push_enabled());
        let (sender, connection) = builder
            .handshake::<_, Bytes>(stream)
            .await
            .map_err(|e| Error::protocol(format!("HTTP/2 handshake failed: {}", e)))?;

        let shared = Arc::new(SessionShared {
            origin: origin.clone(),
            closed: AtomicBool::new(false),
            active_streams: AtomicUsize::new(0),
            last_used: StdMutex::new(Instant::now()),
            shutdown: Notify::new(),
        });

        tokio::spawn(drive(connection, Arc::clone(&shared), Arc::clone(&slot)));
        tokio::spawn(watchdog(
            Arc::clone(&shared),
            self.options.idle_session_timeout(),
        ));

        let session = H2Session { sender, shared };
        *guard = Some(session.clone());
        tracing::debug!(%origin, "session established");
        Ok(session)
    }

    async fn exchange(&self, session: H2Session, req: TransportRequest) -> Result<Response> {
        let mut req = req;
        let payload = req.payload.take();
        let signal = req.signal.clone();
        let guard = StreamGuard::new(Arc::clone(&session.shared));

        let request = build_request(&req)?;

        let sender = session.sender.clone();
        let mut sender = sender.ready().await.map_err(|e| fail(&session, e))?;

        let (mut response_fut, mut send_stream) = sender
            .send_request(request, payload.is_none())
            .map_err(|e| fail(&session, e))?;

        if self.options.push_enabled() {
            tokio::spawn(process_pushes(
                response_fut.push_promises(),
                req.url.clone(),
                self.options.push_promise_handler.clone(),
                self.options.push_handler.clone(),
                self.options.pushed_stream_idle_timeout(),
            ));
        }

        // Ship the request body before waiting on headers.
        if let Some(payload) = payload {
            // The write future borrows the send stream; let it drop
            // before an abort resets the stream.
            let written = {
                let write = write_payload(&mut send_stream, payload);
                match &signal {
                    Some(signal) => tokio::select! {
                        _ = signal.cancelled() => None,
                        res = write => Some(res),
                    },
                    None => Some(write.await),
                }
            };
            match written {
                Some(res) => res?,
                None => {
                    send_stream.send_reset(h2::Reason::CANCEL);
                    return Err(Error::Abort);
                }
            }
        }

        let response = match &signal {
            Some(signal) => tokio::select! {
                _ = signal.cancelled() => {
                    send_stream.send_reset(h2::Reason::CANCEL);
                    return Err(Error::Abort);
                }
                response = response_fut => response.map_err(|e| fail(&session, e))?,
            },
            None => response_fut.await.map_err(|e| fail(&session, e))?,
        };

        let (parts, recv) = response.into_parts();
        let (tx, body) = Body::channel();
        tokio::spawn(pump_body(recv, tx, guard, signal));

        Ok(Response::new(parts.status, Version::HTTP_2, parts.headers, body))
    }
}

/// Map a stream error, closing the session when the connection as a
/// whole is unusable so the next request starts fresh.
fn fail(session: &H2Session, e: h2::Error) -> Error {
    if e.is_go_away() || e.is_io() {
        tracing::warn!(origin = %session.shared.origin, error = %e, "session unusable");
        session.shared.close();
    }
    e.into()
}

/// Build the HTTP/2 request head. `:authority` is derived from the
/// `host` header when present (which is then dropped so the authority is
/// not sent twice); `:path` defaults to `/`.
fn build_request(req: &TransportRequest) -> Result<Request<()>> {
    let mut headers = req.headers.clone();
    let authority = match headers.remove(HOST) {
        Some(host) => host
            .to_str()
            .map_err(|_| Error::protocol("Invalid host header"))?
            .to_string(),
        None => {
            let host = req
                .url
                .host_str()
                .ok_or_else(|| Error::protocol("Request URL has no host"))?;
            match req.url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            }
        }
    };

    let mut path = String::from(req.url.path());
    if path.is_empty() {
        path.push('/');
    }
    if let Some(query) = req.url.query() {
        path.push('?');
        path.push_str(query);
    }

    let uri = Uri::builder()
        .scheme(req.url.scheme())
        .authority(authority)
        .path_and_query(path)
        .build()
        .map_err(|e| Error::protocol(format!("Failed to build request URI: {}", e)))?;

    let mut builder = Request::builder()
        .method(req.method.clone())
        .uri(uri)
        .version(Version::HTTP_2);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    builder
        .body(())
        .map_err(|e| Error::protocol(format!("Failed to build request: {}", e)))
}

async fn write_payload(
    send_stream: &mut h2::SendStream<Bytes>,
    payload: Payload,
) -> Result<()> {
    match payload {
        Payload::Buffered(bytes) => {
            send_stream
                .send_data(bytes, true)
                .map_err(|e| Error::protocol(format!("Failed to send request body: {}", e)))?;
        }
        Payload::Streaming(mut body) => {
            while let Some(chunk) = body.chunk().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        send_stream.send_reset(h2::Reason::CANCEL);
                        return Err(e);
                    }
                };
                send_stream
                    .send_data(chunk, false)
                    .map_err(|e| {
                        Error::protocol(format!("Failed to send request body: {}", e))
                    })?;
            }
            send_stream
                .send_data(Bytes::new(), true)
                .map_err(|e| Error::protocol(format!("Failed to send request body: {}", e)))?;
        }
    }
    Ok(())
}

/// Stream the response body into the channel, releasing flow-control
/// window as chunks are consumed. Dropping the receive stream early
/// resets it with CANCEL.
async fn pump_body(
    mut recv: RecvStream,
    tx: BodySender,
    guard: StreamGuard,
    signal: Option<AbortSignal>,
) {
    loop {
        let next = match &signal {
            Some(signal) => tokio::select! {
                _ = signal.cancelled() => {
                    tx.error(Error::Abort).await;
                    break;
                }
                next = recv.data() => next,
            },
            None => recv.data().await,
        };
        match next {
            Some(Ok(chunk)) => {
                let _ = recv.flow_control().release_capacity(chunk.len());
                if !tx.send(chunk).await {
                    // Body dropped by the caller; stop and reset.
                    break;
                }
            }
            Some(Err(e)) => {
                tracing::warn!("response stream error: {}", e);
                tx.error(e.into()).await;
                break;
            }
            None => break,
        }
    }
    drop(guard);
}

/// Drive the connection; on termination mark the session closed and
/// evict it from its slot.
async fn drive(
    connection: Connection<MaybeTlsStream, Bytes>,
    shared: Arc<SessionShared>,
    slot: Slot,
) {
    tokio::select! {
        result = connection => match result {
            Ok(()) => tracing::debug!(origin = %shared.origin, "session closed"),
            Err(e) => {
                if let Some(reason) = e.reason() {
                    tracing::warn!(origin = %shared.origin, ?reason, "session ended: {}", e);
                } else {
                    tracing::warn!(origin = %shared.origin, "session error: {}", e);
                }
            }
        },
        _ = shared.shutdown.notified() => {
            tracing::debug!(origin = %shared.origin, "session torn down");
        }
    }
    shared.closed.store(true, Ordering::Release);

    let mut guard = slot.lock().await;
    if let Some(session) = guard.as_ref() {
        if Arc::ptr_eq(&session.shared, &shared) {
            *guard = None;
        }
    }
}

/// Close the session once it has sat idle with no active streams.
async fn watchdog(shared: Arc<SessionShared>, idle_timeout: Duration) {
    loop {
        if shared.is_closed() {
            return;
        }
        let idle = shared.idle_for();
        if idle >= idle_timeout && shared.active_streams.load(Ordering::Acquire) == 0 {
            tracing::debug!(origin = %shared.origin, "session idle, closing");
            shared.close();
            return;
        }
        let wait = idle_timeout
            .saturating_sub(idle)
            .max(Duration::from_millis(50));
        tokio::time::sleep(wait).await;
    }
}

/// Handle the server-initiated streams of one request.
async fn process_pushes(
    mut pushes: PushPromises,
    base: Url,
    promise_handler: Option<PushPromiseHandler>,
    push_handler: Option<PushHandler>,
    idle_timeout: Duration,
) {
    while let Some(promise) = pushes.push_promise().await {
        let promise = match promise {
            Ok(promise) => promise,
            Err(e) => {
                tracing::warn!("push promise error: {}", e);
                return;
            }
        };
        let (request, pushed) = promise.into_parts();
        let url = match push_url(&base, request.uri()) {
            Some(url) => url,
            None => {
                tracing::warn!(uri = %request.uri(), "unresolvable push promise URL");
                continue;
            }
        };

        if let Some(handler) = &promise_handler {
            if !handler(&url, request.headers()) {
                // Dropping the future resets the pushed stream.
                tracing::debug!(%url, "push promise rejected");
                continue;
            }
        }

        tokio::spawn(deliver_push(
            pushed,
            url,
            request.method().clone(),
            request.headers().clone(),
            push_handler.clone(),
            idle_timeout,
        ));
    }
}

async fn deliver_push(
    pushed: PushedResponseFuture,
    url: Url,
    method: http::Method,
    request_headers: HeaderMap,
    handler: Option<PushHandler>,
    idle_timeout: Duration,
) {
    let response = match pushed.await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!(%url, "pushed stream failed: {}", e);
            return;
        }
    };
    let (parts, recv) = response.into_parts();
    let (tx, body) = Body::channel();
    tokio::spawn(push_pump(recv, tx, idle_timeout, url.clone()));

    let response = Response::new(parts.status, Version::HTTP_2, parts.headers, body)
        .with_url(url.clone());
    match handler {
        Some(handler) => handler(PushedResponse {
            url,
            method,
            request_headers,
            response,
        }),
        // Nobody to deliver to: dropping the body cancels the pump.
        None => tracing::debug!(%url, "pushed response dropped (no push handler)"),
    }
}

/// Like [`pump_body`], but a consumer that stalls for longer than the
/// pushed-stream idle timeout gets the stream evicted from under it.
async fn push_pump(mut recv: RecvStream, tx: BodySender, idle_timeout: Duration, url: Url) {
    loop {
        match recv.data().await {
            Some(Ok(chunk)) => {
                let _ = recv.flow_control().release_capacity(chunk.len());
                match tokio::time::timeout(idle_timeout, tx.sender().send(Ok(chunk))).await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => return,
                    Err(_) => {
                        tracing::debug!(%url, "pushed stream idle, evicting");
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                tracing::debug!(%url, "pushed stream error: {}", e);
                tx.error(e.into()).await;
                return;
            }
            None => return,
        }
    }
}

/// Resolve the promised URL from the push pseudo-headers, falling back
/// to the requesting URL's origin when the promise is origin-relative.
fn push_url(base: &Url, uri: &Uri) -> Option<Url> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        Url::parse(&uri.to_string()).ok()
    } else {
        base.join(uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/"))
            .ok()
    }
}
