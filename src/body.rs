//! Response/request body representation.
//!
//! A [`Body`] is either fully buffered or a stream of chunks fed by a
//! transport task. Consumption is one-shot: once `bytes()`, `text()`,
//! `json()` or the chunk iterator has drained it, the body is disturbed
//! and further reads fail with [`Error::BodyConsumed`].

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Default channel capacity for streamed bodies (chunks, not bytes).
const STREAM_CAPACITY: usize = 16;

#[derive(Debug)]
enum Inner {
    Empty,
    Full(Bytes),
    Stream(mpsc::Receiver<Result<Bytes>>),
    Taken,
}

/// An HTTP message body.
#[derive(Debug)]
pub struct Body {
    inner: Inner,
}

/// Producer half of a streamed [`Body`].
#[derive(Debug, Clone)]
pub struct BodySender {
    tx: mpsc::Sender<Result<Bytes>>,
}

impl Body {
    /// An empty body.
    pub fn empty() -> Self {
        Self { inner: Inner::Empty }
    }

    /// A fully buffered body.
    pub fn full(bytes: impl Into<Bytes>) -> Self {
        Self {
            inner: Inner::Full(bytes.into()),
        }
    }

    /// A streamed body fed through the returned sender. The body ends
    /// when the last sender clone is dropped; an `Err` chunk terminates
    /// it with that error.
    pub fn channel() -> (BodySender, Self) {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        (
            BodySender { tx },
            Self {
                inner: Inner::Stream(rx),
            },
        )
    }

    /// Whether this body has been consumed ("disturbed").
    pub fn is_consumed(&self) -> bool {
        matches!(self.inner, Inner::Taken)
    }

    /// Whether this body is streamed rather than buffered.
    pub fn is_stream(&self) -> bool {
        matches!(self.inner, Inner::Stream(_))
    }

    /// Pull the next chunk. Returns `None` once the body is exhausted;
    /// an `Err` chunk is terminal.
    pub async fn chunk(&mut self) -> Option<Result<Bytes>> {
        match &mut self.inner {
            Inner::Empty | Inner::Taken => {
                self.inner = Inner::Taken;
                None
            }
            Inner::Full(_) => {
                let bytes = match std::mem::replace(&mut self.inner, Inner::Taken) {
                    Inner::Full(b) => b,
                    _ => unreachable!(),
                };
                if bytes.is_empty() {
                    None
                } else {
                    Some(Ok(bytes))
                }
            }
            Inner::Stream(rx) => match rx.recv().await {
                Some(Ok(chunk)) => Some(Ok(chunk)),
                Some(Err(e)) => {
                    self.inner = Inner::Taken;
                    Some(Err(e))
                }
                None => {
                    self.inner = Inner::Taken;
                    None
                }
            },
        }
    }

    /// Buffer the entire body. One-shot: a second call fails with
    /// [`Error::BodyConsumed`].
    pub async fn bytes(&mut self) -> Result<Bytes> {
        match std::mem::replace(&mut self.inner, Inner::Taken) {
            Inner::Empty => Ok(Bytes::new()),
            Inner::Full(bytes) => Ok(bytes),
            Inner::Stream(mut rx) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = rx.recv().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
            Inner::Taken => Err(Error::BodyConsumed),
        }
    }

    /// Buffer the body and decode it as UTF-8.
    pub async fn text(&mut self) -> Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::decode(format!("UTF-8 decode error: {}", e)))
    }

    /// Buffer the body and deserialize it as JSON.
    pub async fn json<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(Error::from)
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl BodySender {
    /// Push a chunk downstream. Returns `false` when the reader is gone,
    /// which producers treat as cancellation.
    pub async fn send(&self, chunk: Bytes) -> bool {
        self.tx.send(Ok(chunk)).await.is_ok()
    }

    /// Terminate the stream with an error so a pending reader sees it.
    pub async fn error(&self, err: Error) {
        let _ = self.tx.send(Err(err)).await;
    }

    /// Whether the reader side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<Result<Bytes>> {
        &self.tx
    }
}
