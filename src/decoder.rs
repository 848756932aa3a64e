//! Transparent content decoding for response bodies.
//!
//! Wraps a body stream with the decoder matching `content-encoding`,
//! decompressing chunk-at-a-time as the transport delivers data. Bodies
//! that cannot carry content (204, 304, `content-length: 0`) and
//! unrecognized codings pass through untouched.

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderMap, StatusCode};

use brotli::DecompressorWriter;
use flate2::write::{DeflateDecoder, GzDecoder, ZlibDecoder};
use std::io::Write;
use zstd::stream::write::Decoder as ZstdDecoder;

use crate::body::{Body, BodySender};
use crate::error::{Error, Result};

/// Buffer size for the brotli decompressor.
const BROTLI_BUFFER_SIZE: usize = 4096;

/// Content codings this client can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coding {
    Gzip,
    Deflate,
    Brotli,
    Zstd,
}

impl Coding {
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(CONTENT_ENCODING)?.to_str().ok()?;
        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "deflate" | "x-deflate" => Some(Self::Deflate),
            "br" => Some(Self::Brotli),
            "zstd" => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// Wrap a response body with the decoder its headers call for.
///
/// Returns the input unchanged when the status cannot carry content
/// (204, 304), when `content-length` is 0, or when `content-encoding`
/// is absent or unrecognized.
pub(crate) fn decode(status: StatusCode, headers: &HeaderMap, body: Body) -> Body {
    if status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        return body;
    }
    if headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        == Some(0)
    {
        return body;
    }
    let Some(coding) = Coding::from_headers(headers) else {
        return body;
    };

    let decoder = ContentDecoder::new(coding);
    let (tx, decoded) = Body::channel();
    tokio::spawn(pump(decoder, body, tx));
    decoded
}

async fn pump(mut decoder: ContentDecoder, mut raw: Body, tx: BodySender) {
    loop {
        match raw.chunk().await {
            Some(Ok(chunk)) => match decoder.feed(&chunk) {
                Ok(decoded) => {
                    if !decoded.is_empty() && !tx.send(decoded).await {
                        // Reader dropped the body; stop decoding.
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!("content decode failed: {}", e);
                    tx.error(e).await;
                    return;
                }
            },
            // Upstream destruction (abort, transport error) propagates so
            // the decoder does not sit waiting for input that never comes.
            Some(Err(e)) => {
                tx.error(e).await;
                return;
            }
            None => break,
        }
    }
    match decoder.finish() {
        Ok(tail) => {
            if !tail.is_empty() {
                tx.send(tail).await;
            }
        }
        Err(e) => {
            tracing::warn!("content decode failed at end of stream: {}", e);
            tx.error(e).await;
        }
    }
}

enum ContentDecoder {
    Gzip(GzDecoder<Vec<u8>>),
    /// `deflate` before the first byte arrives; the zlib-vs-raw decision
    /// needs the leading CMF byte.
    DeflatePending,
    Zlib(ZlibDecoder<Vec<u8>>),
    RawDeflate(DeflateDecoder<Vec<u8>>),
    Brotli(Box<DecompressorWriter<Vec<u8>>>),
    Zstd(ZstdDecoder<'static, Vec<u8>>),
}

impl ContentDecoder {
    fn new(coding: Coding) -> Self {
        match coding {
            Coding::Gzip => Self::Gzip(GzDecoder::new(Vec::new())),
            Coding::Deflate => Self::DeflatePending,
            Coding::Brotli => Self::Brotli(Box::new(DecompressorWriter::new(
                Vec::new(),
                BROTLI_BUFFER_SIZE,
            ))),
            // Writing into a Vec cannot fail.
            Coding::Zstd => Self::Zstd(
                ZstdDecoder::new(Vec::new()).expect("zstd decoder init"),
            ),
        }
    }

    /// Decompress one chunk, returning whatever output it produced.
    fn feed(&mut self, chunk: &[u8]) -> Result<Bytes> {
        if chunk.is_empty() {
            return Ok(Bytes::new());
        }
        if let Self::DeflatePending = self {
            // Servers disagree on whether `deflate` means zlib-wrapped or
            // raw; sniff the zlib CMF byte (low nibble 8 = deflate).
            *self = if chunk[0] & 0x0f == 0x08 {
                Self::Zlib(ZlibDecoder::new(Vec::new()))
            } else {
                Self::RawDeflate(DeflateDecoder::new(Vec::new()))
            };
        }
        match self {
            Self::Gzip(d) => write_and_take(d, chunk, "gzip"),
            Self::Zlib(d) => write_and_take(d, chunk, "deflate"),
            Self::RawDeflate(d) => write_and_take(d, chunk, "deflate"),
            Self::Brotli(d) => {
                d.write_all(chunk)
                    .and_then(|_| d.flush())
                    .map_err(|e| Error::decode(format!("brotli: {}", e)))?;
                Ok(Bytes::from(std::mem::take(d.get_mut())))
            }
            Self::Zstd(d) => {
                d.write_all(chunk)
                    .and_then(|_| d.flush())
                    .map_err(|e| Error::decode(format!("zstd: {}", e)))?;
                Ok(Bytes::from(std::mem::take(d.get_mut())))
            }
            Self::DeflatePending => unreachable!(),
        }
    }

    /// Finish the stream, validating trailers/checksums and flushing any
    /// remaining output.
    fn finish(self) -> Result<Bytes> {
        match self {
            Self::Gzip(d) => d
                .finish()
                .map(Bytes::from)
                .map_err(|e| Error::decode(format!("gzip: {}", e))),
            Self::Zlib(d) => d
                .finish()
                .map(Bytes::from)
                .map_err(|e| Error::decode(format!("deflate: {}", e))),
            Self::RawDeflate(d) => d
                .finish()
                .map(Bytes::from)
                .map_err(|e| Error::decode(format!("deflate: {}", e))),
            Self::Brotli(mut d) => {
                d.flush()
                    .map_err(|e| Error::decode(format!("brotli: {}", e)))?;
                Ok(Bytes::from(std::mem::take(d.get_mut())))
            }
            Self::Zstd(mut d) => {
                d.flush()
                    .map_err(|e| Error::decode(format!("zstd: {}", e)))?;
                Ok(Bytes::from(std::mem::take(d.get_mut())))
            }
            Self::DeflatePending => Ok(Bytes::new()),
        }
    }
}

fn write_and_take<W>(decoder: &mut W, chunk: &[u8], label: &str) -> Result<Bytes>
where
    W: Write + TakeOutput,
{
    decoder
        .write_all(chunk)
        .and_then(|_| decoder.flush())
        .map_err(|e| Error::decode(format!("{}: {}", label, e)))?;
    Ok(Bytes::from(decoder.take_output()))
}

trait TakeOutput {
    fn take_output(&mut self) -> Vec<u8>;
}

impl TakeOutput for GzDecoder<Vec<u8>> {
    fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(self.get_mut())
    }
}

impl TakeOutput for ZlibDecoder<Vec<u8>> {
    fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(self.get_mut())
    }
}

impl TakeOutput for DeflateDecoder<Vec<u8>> {
    fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(self.get_mut())
    }
}
