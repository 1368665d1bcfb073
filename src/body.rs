//! Response/request body plumbing
//!
//! A [`Body`] is either empty, a single buffer, or a channel-backed
//! stream of chunks.  Handlers pass bodies downstream without copying;
//! `tee` duplicates a stream so one copy can feed a cache capture while
//! the other is served to the client.

use crate::error::{RelayError, Result};
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

/// Channel capacity for streamed bodies
const BODY_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug)]
enum BodyKind {
    Empty,
    Full(Bytes),
    Stream(mpsc::Receiver<Result<Bytes>>),
}

/// An HTTP message body
#[derive(Debug)]
pub struct Body {
    declared_len: Option<u64>,
    kind: BodyKind,
}

impl Body {
    pub fn empty() -> Self {
        Self {
            declared_len: Some(0),
            kind: BodyKind::Empty,
        }
    }

    pub fn full(data: Bytes) -> Self {
        Self {
            declared_len: Some(data.len() as u64),
            kind: BodyKind::Full(data),
        }
    }

    /// A streamed body fed through the returned sender
    pub fn channel(declared_len: Option<u64>) -> (BodySender, Self) {
        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        (
            BodySender { tx },
            Self {
                declared_len,
                kind: BodyKind::Stream(rx),
            },
        )
    }

    /// The length announced by Content-Length or the producer, if known
    pub fn declared_len(&self) -> Option<u64> {
        self.declared_len
    }

    pub fn is_empty_body(&self) -> bool {
        matches!(self.kind, BodyKind::Empty)
    }

    /// The whole body when it is a single buffer, without consuming it
    pub fn full_bytes(&self) -> Option<Bytes> {
        match &self.kind {
            BodyKind::Full(data) => Some(data.clone()),
            _ => None,
        }
    }

    /// Next chunk of the body; `None` at the end
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        match &mut self.kind {
            BodyKind::Empty => None,
            BodyKind::Full(data) => {
                let data = std::mem::take(data);
                self.kind = BodyKind::Empty;
                if data.is_empty() {
                    None
                } else {
                    Some(Ok(data))
                }
            }
            BodyKind::Stream(rx) => rx.recv().await,
        }
    }

    /// Poll flavor of [`next_chunk`](Self::next_chunk), for body adapters
    pub fn poll_chunk(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<Bytes>>> {
        use std::task::Poll;
        match &mut self.kind {
            BodyKind::Empty => Poll::Ready(None),
            BodyKind::Full(data) => {
                let data = std::mem::take(data);
                self.kind = BodyKind::Empty;
                if data.is_empty() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(data)))
                }
            }
            BodyKind::Stream(rx) => rx.poll_recv(cx),
        }
    }

    /// Collect the whole body, failing when it exceeds `limit` bytes
    pub async fn collect(mut self, limit: usize) -> Result<Bytes> {
        if let Some(len) = self.declared_len {
            if len > limit as u64 {
                return Err(RelayError::Internal(format!(
                    "body of {} bytes exceeds the limit of {}",
                    len, limit
                )));
            }
        }

        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            let chunk = chunk?;
            if out.len() + chunk.len() > limit {
                return Err(RelayError::Internal(format!(
                    "body exceeds the limit of {} bytes",
                    limit
                )));
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Duplicate this body.
    ///
    /// The first copy is the authoritative one; the second is best-effort
    /// (a slow or dropped consumer never stalls the first).
    pub fn tee(self) -> (Body, Body) {
        match self.kind {
            BodyKind::Empty => (Body::empty(), Body::empty()),
            BodyKind::Full(data) => (Body::full(data.clone()), Body::full(data)),
            BodyKind::Stream(mut rx) => {
                let declared = self.declared_len;
                let (tx_a, body_a) = Body::channel(declared);
                let (tx_b, body_b) = Body::channel(declared);

                tokio::spawn(async move {
                    let mut b_alive = true;
                    while let Some(chunk) = rx.recv().await {
                        match chunk {
                            Ok(data) => {
                                if b_alive && !tx_b.try_send(data.clone()) {
                                    // the second consumer fell behind; it
                                    // must see an error, never a silently
                                    // truncated body
                                    b_alive = false;
                                    let poison = tx_b.clone();
                                    tokio::spawn(async move {
                                        let _ = poison
                                            .send_error(RelayError::Internal(
                                                "tee consumer fell behind".to_string(),
                                            ))
                                            .await;
                                    });
                                }
                                if tx_a.send(data).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                let _ = tx_b.try_send_error();
                                let _ = tx_a.send_error(e).await;
                                break;
                            }
                        }
                    }
                });

                (body_a, body_b)
            }
        }
    }
}

/// Producer half of a streamed body
#[derive(Clone)]
pub struct BodySender {
    tx: mpsc::Sender<Result<Bytes>>,
}

impl BodySender {
    /// Push one chunk; returns an error when the consumer is gone
    pub async fn send(&self, data: Bytes) -> Result<()> {
        self.tx
            .send(Ok(data))
            .await
            .map_err(|_| RelayError::Internal("body consumer gone".to_string()))
    }

    pub async fn send_error(&self, error: RelayError) -> Result<()> {
        self.tx
            .send(Err(error))
            .await
            .map_err(|_| RelayError::Internal("body consumer gone".to_string()))
    }

    /// Best-effort push used by `tee`; false when the consumer is gone or
    /// its queue is full
    fn try_send(&self, data: Bytes) -> bool {
        self.tx.try_send(Ok(data)).is_ok()
    }

    fn try_send_error(&self) -> std::result::Result<(), ()> {
        self.tx
            .try_send(Err(RelayError::Internal("tee source failed".to_string())))
            .map_err(|_| ())
    }
}
