//! BoringSSL TLS connector with ALPN negotiation.
//!
//! One connector is shared per context. It owns a per-origin connect
//! lock: concurrent handshakes to the same origin are serialized so that
//! N simultaneous first-requests cannot open N connections just to learn
//! the protocol; the callers that lose the race re-check the ALPN cache
//! under the lock and reuse what the winner negotiated.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use boring::ssl::{
    SslConnector, SslMethod, SslSessionCacheMode, SslVerifyMode, SslVersion,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_boring::SslStream;

use crate::alpn::{AlpnProtocol, Origin};
use crate::error::{Error, Result};

/// TLS connector options.
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    /// ALPN preference list offered during the handshake.
    pub alpn_protocols: Vec<AlpnProtocol>,
    /// Verify the peer certificate chain and hostname (default true).
    pub reject_unauthorized: bool,
    /// TLS client session cache size for resumption.
    pub max_cached_sessions: usize,
    /// Deadline for TCP connect plus TLS handshake.
    pub connect_timeout: Option<Duration>,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            alpn_protocols: vec![
                AlpnProtocol::H2,
                AlpnProtocol::Http11,
                AlpnProtocol::Http10,
            ],
            reject_unauthorized: true,
            max_cached_sessions: 100,
            connect_timeout: None,
        }
    }
}

/// Stream that is either plain TCP or TLS.
pub enum MaybeTlsStream {
    /// Plain TCP, used for `http:` and `h2c`.
    Plain(TcpStream),
    /// TLS-wrapped stream for `https:`.
    Tls(SslStream<TcpStream>),
}

impl MaybeTlsStream {
    /// The protocol negotiated via ALPN, or `None` when ALPN did not
    /// happen (plain TCP, or the peer offered nothing).
    pub fn alpn_protocol(&self) -> Option<AlpnProtocol> {
        match self {
            MaybeTlsStream::Plain(_) => None,
            MaybeTlsStream::Tls(stream) => stream
                .ssl()
                .selected_alpn_protocol()
                .and_then(AlpnProtocol::from_bytes),
        }
    }
}

impl std::fmt::Debug for MaybeTlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaybeTlsStream::Plain(_) => f.write_str("MaybeTlsStream::Plain"),
            MaybeTlsStream::Tls(_) => f.write_str("MaybeTlsStream::Tls"),
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeTlsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// BoringSSL-based connector shared by all requests of one context.
pub struct TlsConnector {
    options: ConnectorOptions,
    locks: std::sync::Mutex<HashMap<Origin, Arc<tokio::sync::Mutex<()>>>>,
}

impl TlsConnector {
    /// Create a connector.
    pub fn new(options: ConnectorOptions) -> Self {
        Self {
            options,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// The configured options.
    pub fn options(&self) -> &ConnectorOptions {
        &self.options
    }

    /// The per-origin connect lock. Holders serialize the whole
    /// cache-recheck-then-handshake sequence for an origin.
    pub fn origin_lock(&self, origin: &Origin) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("connect lock map poisoned");
        Arc::clone(
            locks
                .entry(origin.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Open a plain TCP connection to an origin.
    pub async fn connect_tcp(&self, origin: &Origin) -> Result<TcpStream> {
        let addr = format!("{}:{}", origin.host, origin.port);
        let connect = TcpStream::connect(&addr);
        let stream = match self.options.connect_timeout {
            Some(deadline) => tokio::time::timeout(deadline, connect)
                .await
                .map_err(|_| Error::timeout(format!("connect to {}", addr)))?,
            None => connect.await,
        }
        .map_err(|e| Error::connect(format!("Failed to connect to {}: {}", addr, e)))?;
        Ok(stream)
    }

    /// Connect to an origin, performing a TLS handshake with SNI and the
    /// given ALPN list for `https:` origins, plain TCP otherwise. The
    /// negotiated protocol is readable from the returned stream.
    pub async fn connect(
        &self,
        origin: &Origin,
        servername: Option<&str>,
        alpn: Option<&[AlpnProtocol]>,
    ) -> Result<MaybeTlsStream> {
        if origin.scheme != "https" {
            return Ok(MaybeTlsStream::Plain(self.connect_tcp(origin).await?));
        }

        let alpn = alpn.unwrap_or(&self.options.alpn_protocols);
        let connector = self.configure_ssl(alpn)?;
        let domain = servername.unwrap_or(&origin.host).to_string();

        let tcp = self.connect_tcp(origin).await?;

        let mut config = connector
            .configure()
            .map_err(|e| Error::tls(format!("Failed to configure SSL: {}", e)))?;
        if !self.options.reject_unauthorized {
            config.set_verify_hostname(false);
        }

        let handshake = tokio_boring::connect(config, &domain, tcp);
        let stream = match self.options.connect_timeout {
            Some(deadline) => tokio::time::timeout(deadline, handshake)
                .await
                .map_err(|_| Error::timeout(format!("TLS handshake with {}", domain)))?,
            None => handshake.await,
        }
        .map_err(|e| Error::tls(format!("TLS handshake failed: {}", e)))?;

        Ok(MaybeTlsStream::Tls(stream))
    }

    fn configure_ssl(&self, alpn: &[AlpnProtocol]) -> Result<SslConnector> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())
            .map_err(|e| Error::tls(format!("Failed to create SSL connector: {}", e)))?;

        builder
            .set_min_proto_version(Some(SslVersion::TLS1_2))
            .map_err(|e| Error::tls(format!("Failed to set min TLS version: {}", e)))?;
        builder
            .set_max_proto_version(Some(SslVersion::TLS1_3))
            .map_err(|e| Error::tls(format!("Failed to set max TLS version: {}", e)))?;

        // Client-side session caching for handshake resumption.
        builder.set_session_cache_mode(SslSessionCacheMode::CLIENT);
        builder.set_session_cache_size(self.options.max_cached_sessions as i64);

        if !self.options.reject_unauthorized {
            builder.set_verify(SslVerifyMode::NONE);
        }

        if !alpn.is_empty() {
            builder
                .set_alpn_protos(&encode_alpn(alpn))
                .map_err(|e| Error::tls(format!("Failed to set ALPN: {}", e)))?;
        }

        Ok(builder.build())
    }
}

/// Encode an ALPN preference list as the length-prefixed wire format.
fn encode_alpn(protocols: &[AlpnProtocol]) -> Vec<u8> {
    let mut wire = Vec::new();
    for p in protocols {
        let s = p.as_str().as_bytes();
        wire.push(s.len() as u8);
        wire.extend_from_slice(s);
    }
    wire
}
