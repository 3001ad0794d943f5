//! Agent connection transports.
//!
//! Both transports carry the same frames and both support half-close:
//! - `tcp`: length-delimited frames, half-close is a write shutdown.
//! - `websocket`: one binary message per frame, half-close is an empty binary
//!   message since WebSocket has no half-close of its own.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures_util::sink::{Sink, SinkExt};
use futures_util::stream::{SplitSink, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;
use url::Url;

use crate::error::{Code, Status};
use crate::rpc::{FrameSink, FrameStream};

/// Default upper bound for a single frame.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Websocket,
}

/// Raw frame halves of one agent connection.
pub struct Connection {
    pub reader: FrameStream<Bytes>,
    pub writer: FrameSink<Bytes>,
}

/// Length-delimited frames over any byte stream.
pub fn framed<S>(io: S, max_frame_length: usize) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec();
    let (sink, stream) = Framed::new(io, codec).split();
    Connection {
        reader: FrameStream::new(stream.map(|frame| {
            frame
                .map(|bytes| bytes.freeze())
                .map_err(|e| Status::from_io("read frame", &e))
        })),
        writer: FrameSink::new(
            sink.sink_map_err(|e: std::io::Error| Status::from_io("write frame", &e)),
        ),
    }
}

fn ws_status(err: tungstenite::Error) -> Status {
    match err {
        tungstenite::Error::Io(e) => Status::from_io("websocket", &e),
        tungstenite::Error::Capacity(e) => Status::internal(format!("websocket: {e}")),
        tungstenite::Error::Protocol(e) => Status::internal(format!("websocket: {e}")),
        other => Status::unavailable(format!("websocket: {other}")),
    }
}

/// One binary WebSocket message per frame.
pub fn websocket<S>(ws: WebSocketStream<S>) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let reader = futures_util::stream::unfold(stream, |mut stream| async move {
        loop {
            match stream.next().await? {
                Ok(Message::Binary(data)) if data.is_empty() => return None,
                Ok(Message::Binary(data)) => return Some((Ok(Bytes::from(data)), stream)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some((Err(ws_status(e)), stream)),
            }
        }
    });
    Connection {
        reader: FrameStream::new(reader),
        writer: FrameSink::new(WsWriter {
            inner: sink,
            finished: false,
        }),
    }
}

struct WsWriter<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
    finished: bool,
}

impl<S> Sink<Bytes> for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Error = Status;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Status>> {
        self.inner.poll_ready_unpin(cx).map_err(ws_status)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> Result<(), Status> {
        if item.is_empty() {
            return Err(Status::internal("empty frames cannot be sent over websocket"));
        }
        self.inner
            .start_send_unpin(Message::Binary(item.to_vec()))
            .map_err(ws_status)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Status>> {
        self.inner.poll_flush_unpin(cx).map_err(ws_status)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Status>> {
        if !self.finished {
            ready!(self.inner.poll_ready_unpin(cx)).map_err(ws_status)?;
            self.inner
                .start_send_unpin(Message::Binary(Vec::new()))
                .map_err(ws_status)?;
            self.finished = true;
        }
        self.inner.poll_flush_unpin(cx).map_err(ws_status)
    }
}

/// Server side: wraps an accepted TCP connection.
pub async fn accept(
    stream: TcpStream,
    kind: TransportKind,
    max_frame_length: usize,
) -> Result<Connection, Status> {
    match kind {
        TransportKind::Tcp => Ok(framed(stream, max_frame_length)),
        TransportKind::Websocket => {
            let ws = tokio_tungstenite::accept_async(stream)
                .await
                .map_err(ws_status)?;
            Ok(websocket(ws))
        }
    }
}

/// Agent side: `tcp://host:port` or `ws://host:port/path`.
pub async fn connect(url: &Url, max_frame_length: usize) -> Result<Connection, Status> {
    match url.scheme() {
        "tcp" => {
            let host = url
                .host_str()
                .ok_or_else(|| Status::new(Code::InvalidArgument, "server url has no host"))?;
            let port = url
                .port()
                .ok_or_else(|| Status::new(Code::InvalidArgument, "server url has no port"))?;
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(|e| Status::from_io("connect", &e))?;
            stream
                .set_nodelay(true)
                .map_err(|e| Status::from_io("set TCP_NODELAY", &e))?;
            debug!("Connected to {} over tcp", url);
            Ok(framed(stream, max_frame_length))
        }
        "ws" => {
            let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(ws_status)?;
            debug!("Connected to {} over websocket", url);
            Ok(websocket(ws))
        }
        other => Err(Status::new(
            Code::InvalidArgument,
            format!("unsupported server url scheme: {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn framed_connection_half_closes() {
        let (a, b) = tokio::io::duplex(1024);
        let Connection {
            reader: mut a_reader,
            writer: mut a_writer,
        } = framed(a, DEFAULT_MAX_FRAME_LENGTH);
        let Connection {
            reader: mut b_reader,
            writer: mut b_writer,
        } = framed(b, DEFAULT_MAX_FRAME_LENGTH);

        a_writer.send(Bytes::from_static(b"ping")).await.unwrap();
        a_writer.close().await.unwrap();
        assert_eq!(
            b_reader.recv().await.unwrap(),
            Some(Bytes::from_static(b"ping"))
        );
        assert_eq!(b_reader.recv().await.unwrap(), None);

        // The other direction still works after the half-close.
        b_writer.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(
            a_reader.recv().await.unwrap(),
            Some(Bytes::from_static(b"pong"))
        );
    }

    #[tokio::test]
    async fn websocket_connection_half_closes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = accept(stream, TransportKind::Websocket, DEFAULT_MAX_FRAME_LENGTH)
                .await
                .unwrap();
            let first = conn.reader.recv().await.unwrap();
            let end = conn.reader.recv().await.unwrap();
            conn.writer.send(Bytes::from_static(b"pong")).await.unwrap();
            (first, end)
        });

        let url = Url::parse(&format!("ws://{addr}/connect")).unwrap();
        let mut conn = connect(&url, DEFAULT_MAX_FRAME_LENGTH).await.unwrap();
        conn.writer.send(Bytes::from_static(b"ping")).await.unwrap();
        conn.writer.close().await.unwrap();
        assert_eq!(
            conn.reader.recv().await.unwrap(),
            Some(Bytes::from_static(b"pong"))
        );

        let (first, end) = server.await.unwrap();
        assert_eq!(first, Some(Bytes::from_static(b"ping")));
        assert_eq!(end, None);
    }

    #[test]
    fn transport_kind_reads_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            kind: TransportKind,
        }
        let parsed: Wrapper = toml::from_str("kind = \"websocket\"").unwrap();
        assert_eq!(parsed.kind, TransportKind::Websocket);
    }
}
