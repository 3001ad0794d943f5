//! HTTP plumbing shared by both adapters: header and query conversion, the
//! channel-fed request/response body, and raw byte piping after an upgrade.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, SizeHint};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use url::form_urlencoded;

use crate::error::{AbortHandler, Code, Status};
use crate::proto::Values;
use crate::rpc::FrameSink;

/// Body of proxied responses. An error aborts the client connection.
pub type ProxyBody = BoxBody<Bytes, AbortHandler>;

/// Default size of `BodyChunk` and `UpgradeChunk` payloads.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 32 * 1024;

/// Header fields that only make sense for a single connection.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
];

pub fn full_body<E: 'static>(data: impl Into<Bytes>) -> BoxBody<Bytes, E> {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn values_from_headers(headers: &HeaderMap) -> Values {
    let mut values = Values::new();
    for (name, value) in headers {
        values
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    values
}

pub fn headers_from_values(values: &Values) -> Result<HeaderMap, Status> {
    let mut headers = HeaderMap::new();
    for (name, list) in values {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            Status::new(Code::InvalidArgument, format!("invalid header name {name:?}: {e}"))
        })?;
        for value in list {
            let value = HeaderValue::from_str(value).map_err(|e| {
                Status::new(
                    Code::InvalidArgument,
                    format!("invalid value for header {name}: {e}"),
                )
            })?;
            headers.append(name.clone(), value);
        }
    }
    Ok(headers)
}

/// Drops hop-by-hop fields. `Connection` and `Upgrade` survive when the
/// message negotiates an upgrade, since the peer needs them to agree on it.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    for name in HOP_BY_HOP_HEADERS {
        if keep_upgrade && (*name == "connection" || *name == "upgrade") {
            continue;
        }
        headers.remove(*name);
    }
}

pub fn decode_query(query: Option<&str>) -> Values {
    let mut values = Values::new();
    if let Some(query) = query {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            values
                .entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }
    }
    values
}

/// Keys come out sorted so the same multimap always encodes the same way.
pub fn encode_query(values: &Values) -> String {
    let mut keys: Vec<&String> = values.keys().collect();
    keys.sort();
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for key in keys {
        for value in &values[key] {
            serializer.append_pair(key, value);
        }
    }
    serializer.finish()
}

/// A body fed from a channel. Used for the request the agent sends upstream
/// and for the response the proxy writes to its client.
#[derive(Debug)]
pub struct ChunkBody<E = Status> {
    rx: Option<mpsc::Receiver<Result<Bytes, E>>>,
    remaining: Option<u64>,
}

impl<E> ChunkBody<E> {
    /// `length` is the declared content length, if any.
    pub fn new(rx: mpsc::Receiver<Result<Bytes, E>>, length: Option<u64>) -> Self {
        Self {
            rx: Some(rx),
            remaining: length,
        }
    }

    /// A body that has already ended.
    pub fn empty() -> Self {
        Self {
            rx: None,
            remaining: Some(0),
        }
    }
}

impl<E> Body for ChunkBody<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    type Data = Bytes;
    type Error = E;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, E>>> {
        let this = self.get_mut();
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(None);
        };
        match ready!(rx.poll_recv(cx)) {
            Some(Ok(data)) => {
                if let Some(remaining) = this.remaining.as_mut() {
                    *remaining = remaining.saturating_sub(data.len() as u64);
                }
                Poll::Ready(Some(Ok(Frame::data(data))))
            }
            Some(Err(err)) => {
                this.rx = None;
                Poll::Ready(Some(Err(err)))
            }
            None => {
                this.rx = None;
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.rx.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        match self.remaining {
            Some(remaining) => SizeHint::with_exact(remaining),
            None => SizeHint::default(),
        }
    }
}

/// Splits `data` into pieces of at most `max` bytes without copying.
pub fn chunks(mut data: Bytes, max: usize) -> impl Iterator<Item = Bytes> {
    let max = max.max(1);
    std::iter::from_fn(move || {
        if data.is_empty() {
            None
        } else {
            Some(data.split_to(data.len().min(max)))
        }
    })
}

/// Pipes an upgraded connection through a stream: bytes read from `io` go out
/// as messages built by `wrap`, bytes from `inbound` are written to `io`.
///
/// Piping stops as soon as either side closes. The other side is then closed
/// too: `io` gets a write shutdown and `outbound` a half-close.
pub async fn pipe_upgraded<IO, M>(
    io: IO,
    mut inbound: mpsc::Receiver<Bytes>,
    mut outbound: FrameSink<M>,
    max_chunk: usize,
    wrap: fn(Bytes) -> M,
) -> Result<(), Status>
where
    IO: AsyncRead + AsyncWrite,
    M: Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(io);

    let to_io = async {
        while let Some(data) = inbound.recv().await {
            writer
                .write_all(&data)
                .await
                .map_err(|e| Status::from_io("write upgraded connection", &e))?;
        }
        Ok::<_, Status>(())
    };

    let from_io = async {
        let mut buf = vec![0u8; max_chunk.max(1)];
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| Status::from_io("read upgraded connection", &e))?;
            if n == 0 {
                return Ok::<_, Status>(());
            }
            outbound.send(wrap(Bytes::copy_from_slice(&buf[..n]))).await?;
        }
    };

    let result = tokio::select! {
        res = to_io => res,
        res = from_io => res,
    };
    // Either peer may already be gone; `result` carries what went wrong.
    let _ = writer.shutdown().await;
    let _ = outbound.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::pipe;

    #[test]
    fn header_values_survive_conversion() {
        let mut headers = HeaderMap::new();
        headers.append("accept", HeaderValue::from_static("text/plain"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        headers.insert("x-trace", HeaderValue::from_static("abc"));

        let values = values_from_headers(&headers);
        assert_eq!(values["accept"], ["text/plain", "application/json"]);
        assert_eq!(headers_from_values(&values).unwrap(), headers);
    }

    #[test]
    fn bad_header_name_is_rejected() {
        let mut values = Values::new();
        values.insert("bad header".to_string(), vec!["x".to_string()]);
        let err = headers_from_values(&values).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn hop_by_hop_fields_are_dropped_unless_upgrading() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("upgrade"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        let mut upgrading = headers.clone();
        strip_hop_by_hop(&mut upgrading, true);
        assert!(upgrading.contains_key("upgrade"));
        assert!(!upgrading.contains_key("transfer-encoding"));

        strip_hop_by_hop(&mut headers, false);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn query_round_trips_through_multimap() {
        let values = decode_query(Some("watch=true&label=a%3Db&label=c"));
        assert_eq!(values["label"], ["a=b", "c"]);
        assert_eq!(encode_query(&values), "label=a%3Db&label=c&watch=true");
        assert!(decode_query(None).is_empty());
    }

    #[test]
    fn chunks_respect_the_limit() {
        let pieces: Vec<Bytes> = chunks(Bytes::from_static(b"abcdefg"), 3).collect();
        assert_eq!(pieces, ["abc", "def", "g"]);
        assert_eq!(chunks(Bytes::new(), 3).count(), 0);
    }

    #[tokio::test]
    async fn chunk_body_reports_remaining_length() {
        let (tx, rx) = mpsc::channel(4);
        let mut body = ChunkBody::<Status>::new(rx, Some(5));
        assert_eq!(body.size_hint().exact(), Some(5));

        tx.send(Ok(Bytes::from_static(b"abc"))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"de"))).await.unwrap();
        drop(tx);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected, Bytes::from_static(b"abcde"));

        let empty = ChunkBody::<Status>::empty();
        assert!(empty.is_end_stream());
        assert_eq!(empty.size_hint().exact(), Some(0));
        body = empty;
        assert!(body.frame().await.is_none());
    }

    #[tokio::test]
    async fn upgraded_bytes_flow_both_ways() {
        let (near, mut far) = tokio::io::duplex(64);
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = pipe::<Bytes>(4);

        let piping = tokio::spawn(pipe_upgraded(near, in_rx, out_tx, 16, |data| data));

        in_tx.send(Bytes::from_static(b"PING")).await.unwrap();
        let mut buf = [0u8; 4];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");

        far.write_all(b"PONG").await.unwrap();
        assert_eq!(out_rx.recv().await.unwrap(), Some(Bytes::from_static(b"PONG")));

        // Closing one side ends the pipe and closes the other side too.
        far.shutdown().await.unwrap();
        piping.await.unwrap().unwrap();
        assert_eq!(out_rx.recv().await.unwrap(), None);
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
        drop(in_tx);
    }
}
