//! Streams of frames and the in-process plumbing around them.
//!
//! A [`FrameStream`] / [`FrameSink`] pair is the transport-independent view of
//! one direction each of a duplex stream. Network transports live in
//! [`crate::transport`]; this module only knows about boxed streams and sinks.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future;
use futures_util::sink::{Sink, SinkExt};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::Status;
use crate::framing::Oneof;

/// Call metadata: a string multimap.
pub type Metadata = HashMap<String, Vec<String>>;

/// Receiving half of a stream. `Ok(None)` is a clean end of stream.
pub struct FrameStream<M> {
    inner: BoxStream<'static, Result<M, Status>>,
}

impl<M: Send + 'static> FrameStream<M> {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<M, Status>> + Send + 'static,
    {
        Self {
            inner: stream.boxed(),
        }
    }

    pub fn from_receiver(rx: mpsc::Receiver<Result<M, Status>>) -> Self {
        Self::new(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }

    pub async fn recv(&mut self) -> Result<Option<M>, Status> {
        self.inner.next().await.transpose()
    }
}

impl FrameStream<Bytes> {
    /// Decodes raw frames into messages of `M`.
    pub fn decode<M: Oneof>(self) -> FrameStream<M> {
        FrameStream::new(
            self.inner
                .map(|frame| frame.and_then(|bytes| M::decode(&bytes))),
        )
    }
}

/// Sending half of a stream.
pub struct FrameSink<M> {
    inner: Pin<Box<dyn Sink<M, Error = Status> + Send>>,
}

impl<M: Send + 'static> FrameSink<M> {
    pub fn new<S>(sink: S) -> Self
    where
        S: Sink<M, Error = Status> + Send + 'static,
    {
        Self {
            inner: Box::pin(sink),
        }
    }

    pub fn from_sender(tx: mpsc::Sender<Result<M, Status>>) -> Self {
        Self::new(futures_util::sink::unfold(tx, |tx, msg: M| async move {
            tx.send(Ok(msg))
                .await
                .map_err(|_| Status::unavailable("peer closed the stream"))?;
            Ok::<_, Status>(tx)
        }))
    }

    pub async fn send(&mut self, msg: M) -> Result<(), Status> {
        self.inner.send(msg).await
    }

    /// Half-closes the stream: the peer sees a clean end of stream while this
    /// side may keep receiving.
    pub async fn close(mut self) -> Result<(), Status> {
        self.inner.close().await
    }
}

impl FrameSink<Bytes> {
    /// Encodes messages of `M` into raw frames.
    pub fn encode<M: Oneof>(self) -> FrameSink<M> {
        FrameSink::new(self.inner.with(|msg: M| future::ready(msg.encode())))
    }
}

/// Bounded in-memory stream.
pub fn pipe<M: Send + 'static>(capacity: usize) -> (FrameSink<M>, FrameStream<M>) {
    let (tx, rx) = mpsc::channel(capacity);
    (FrameSink::from_sender(tx), FrameStream::from_receiver(rx))
}

/// Server side of a proxied call: what a tunnel forwards to the agent.
pub struct IncomingStream {
    pub method: String,
    pub metadata: Metadata,
    /// Raw request frames, forwarded verbatim.
    pub frames: FrameStream<Bytes>,
    /// Cancelled when the caller goes away.
    pub cancel: CancellationToken,
}

/// Caller side of a proxied call.
pub struct ClientStream {
    pub requests: FrameSink<Bytes>,
    pub responses: FrameStream<Bytes>,
    /// Cancels the matching [`IncomingStream`] when dropped.
    pub guard: DropGuard,
}

/// Receives what the agent sends back while a tunnel forwards a call.
#[async_trait]
pub trait ForwardCallbacks: Send + Sync {
    async fn header(&self, meta: Metadata) -> Result<(), Status>;

    async fn message(&self, data: Bytes) -> Result<(), Status>;

    async fn trailer(&self, meta: Metadata) -> Result<(), Status>;

    /// Called for an `Error` frame from the agent. Returns the status to hand
    /// to the caller once forwarding is over.
    fn error(&self, status: Status) -> Status;
}

/// What travels from the forwarding side to a [`ClientStream`].
enum Delivery {
    Message(Bytes),
    /// The agent finished its half of the call.
    Trailer,
    Failed(Status),
}

/// Feeds a [`ClientStream`]'s responses.
#[derive(Clone)]
pub struct ResponseSender {
    tx: mpsc::Sender<Delivery>,
}

impl ResponseSender {
    /// Delivers the call's final outcome. An error is lost if the response
    /// stream already ended with a trailer.
    pub async fn finish(self, result: Result<(), Status>) {
        if let Err(status) = result {
            let _ = self.tx.send(Delivery::Failed(status)).await;
        }
    }
}

#[async_trait]
impl ForwardCallbacks for ResponseSender {
    async fn header(&self, _meta: Metadata) -> Result<(), Status> {
        Ok(())
    }

    async fn message(&self, data: Bytes) -> Result<(), Status> {
        self.tx
            .send(Delivery::Message(data))
            .await
            .map_err(|_| Status::cancelled("client stream is gone"))
    }

    async fn trailer(&self, _meta: Metadata) -> Result<(), Status> {
        let _ = self.tx.send(Delivery::Trailer).await;
        Ok(())
    }

    fn error(&self, status: Status) -> Status {
        status
    }
}

/// Ends at the first trailer or failure, dropping the receiver so that later
/// deliveries fail fast instead of piling up.
fn delivered(rx: mpsc::Receiver<Delivery>) -> FrameStream<Bytes> {
    FrameStream::new(futures_util::stream::unfold(Some(rx), |rx| async move {
        let mut rx = rx?;
        match rx.recv().await? {
            Delivery::Message(data) => Some((Ok(data), Some(rx))),
            Delivery::Failed(status) => Some((Err(status), None)),
            Delivery::Trailer => None,
        }
    }))
}

/// Creates both ends of an in-process call.
pub fn duplex(
    method: impl Into<String>,
    metadata: Metadata,
    capacity: usize,
) -> (ClientStream, IncomingStream, ResponseSender) {
    let (requests, frames) = pipe(capacity);
    let (tx, rx) = mpsc::channel(capacity);
    let cancel = CancellationToken::new();

    let client = ClientStream {
        requests,
        responses: delivered(rx),
        guard: cancel.clone().drop_guard(),
    };
    let incoming = IncomingStream {
        method: method.into(),
        metadata,
        frames,
        cancel,
    };
    (client, incoming, ResponseSender { tx })
}
