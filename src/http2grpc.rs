//! Proxy side of a proxied HTTP call.
//!
//! An incoming request is framed onto a call stream while the response frames
//! coming back are decoded into the HTTP response for the original client. The
//! response head is handed out as soon as its Header frame arrives; body
//! chunks follow as a streaming body.

use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{AbortHandler, Status};
use crate::framing::visitor::{StreamVisitor, VisitorError};
use crate::http::{
    chunks, decode_query, headers_from_values, pipe_upgraded, strip_hop_by_hop,
    values_from_headers, ChunkBody, ProxyBody,
};
use crate::proto::{
    http_field, is_upgrade, BodyChunk, HttpRequest, HttpResponse, RequestHeader,
    ResponseHeader, Trailer, TypedValue, UpgradeChunk,
};
use crate::rpc::{FrameSink, FrameStream};

const BODY_BUFFER: usize = 16;

type SendResult = Result<Option<FrameSink<HttpRequest>>, Status>;

/// Where decoded response frames go.
pub struct ResponseReader {
    header: Option<oneshot::Sender<Result<ResponseHeader, Status>>>,
    body: Option<mpsc::Sender<Result<Bytes, AbortHandler>>>,
    upgrade: Option<mpsc::Sender<Bytes>>,
    drained: Option<oneshot::Sender<()>>,
    upgrade_requested: bool,
    switching: bool,
    empty_body: bool,
}

impl ResponseReader {
    /// Before the head went out the failure becomes the response; after that
    /// it can only abort the body.
    async fn fail(&mut self, status: Status) {
        if let Some(header) = self.header.take() {
            let _ = header.send(Err(status));
        } else if let Some(body) = self.body.take() {
            let _ = body.send(Err(AbortHandler(status))).await;
        } else {
            debug!(error = %status, "Response stream failed after the body was complete");
        }
    }
}

type ResponseVisitor = StreamVisitor<HttpResponse, ResponseReader>;

fn on_header<'c>(reader: &'c mut ResponseReader, header: ResponseHeader) -> BoxFuture<'c, Result<(), Status>> {
    if header.is_switching_protocols() {
        if !reader.upgrade_requested {
            return future::ready(Err(Status::internal(format!(
                "unexpected status code {} for non-upgrade request",
                header.status_code
            ))))
            .boxed();
        }
        reader.switching = true;
    } else {
        reader.upgrade = None;
    }
    reader.empty_body = header.content_length == Some(0);
    let result = match reader.header.take() {
        Some(tx) => tx
            .send(Ok(header))
            .map_err(|_| Status::cancelled("client went away before the response head")),
        None => Err(Status::internal("duplicate response Header")),
    };
    future::ready(result).boxed()
}

fn on_body_chunk<'c>(reader: &'c mut ResponseReader, data: Bytes) -> BoxFuture<'c, Result<(), Status>> {
    async move {
        if reader.empty_body {
            return Err(Status::internal(
                "unexpected BodyChunk for response with content length 0",
            ));
        }
        if let Some(body) = &reader.body {
            body.send(Ok(data))
                .await
                .map_err(|_| Status::cancelled("client stopped reading the response"))?;
        }
        Ok(())
    }
    .boxed()
}

fn on_trailer<'c>(reader: &'c mut ResponseReader, _: Trailer) -> BoxFuture<'c, Result<(), Status>> {
    reader.body = None;
    if let Some(drained) = reader.drained.take() {
        let _ = drained.send(());
    }
    future::ready(Ok(())).boxed()
}

fn on_upgrade_chunk<'c>(reader: &'c mut ResponseReader, data: Bytes) -> BoxFuture<'c, Result<(), Status>> {
    async move {
        if !reader.switching {
            return Err(Status::internal(
                "unexpected UpgradeData for non-upgrade response",
            ));
        }
        if let Some(upgrade) = &reader.upgrade {
            let _ = upgrade.send(data).await;
        }
        Ok(())
    }
    .boxed()
}

fn on_eof(reader: &mut ResponseReader) -> BoxFuture<'_, Result<(), Status>> {
    reader.upgrade = None;
    let result = if reader.header.is_some() {
        Err(Status::internal("response stream ended before its Header"))
    } else if reader.body.is_some() {
        Err(Status::unavailable("response stream ended before its Trailer"))
    } else {
        Ok(())
    };
    future::ready(result).boxed()
}

/// Frames HTTP requests onto call streams and decodes their responses.
#[derive(Clone)]
pub struct HttpToGrpc {
    max_chunk: usize,
    visitor: Arc<ResponseVisitor>,
}

impl HttpToGrpc {
    pub fn new(max_chunk: usize) -> Result<Self, VisitorError> {
        let visitor = StreamVisitor::builder()
            .on::<ResponseHeader, _>(on_header)
            .on_data(http_field::BODY_CHUNK, on_body_chunk)
            .on::<Trailer, _>(on_trailer)
            .on_data(http_field::UPGRADE_CHUNK, on_upgrade_chunk)
            .on_eof(on_eof)
            .build()?;
        Ok(Self {
            max_chunk: max_chunk.max(1),
            visitor: Arc::new(visitor),
        })
    }

    /// Sends `request` as `url_path` over `requests` and builds the response
    /// from `responses`.
    ///
    /// Returns once the response head is known; the body keeps streaming in
    /// the background. `keep_alive` lives until the response stream ends,
    /// which is how the caller ties the call's lifetime to it. An error
    /// returned here means nothing was written to the client yet.
    pub async fn forward<B>(
        &self,
        mut request: Request<B>,
        url_path: String,
        extra: Option<TypedValue>,
        requests: FrameSink<HttpRequest>,
        mut responses: FrameStream<HttpResponse>,
        keep_alive: impl Send + 'static,
    ) -> Result<Response<ProxyBody>, Status>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Display + Send,
    {
        let header_fields = values_from_headers(request.headers());
        let upgrade_requested = is_upgrade(&header_fields);
        let on_upgrade = upgrade_requested.then(|| hyper::upgrade::on(&mut request));

        let (parts, body) = request.into_parts();
        let header = RequestHeader {
            method: parts.method.to_string(),
            url_path,
            query: decode_query(parts.uri.query()),
            header: header_fields,
            extra,
            content_length: body.size_hint().exact().and_then(|n| i64::try_from(n).ok()),
        };
        debug!(method = %header.method, path = %header.url_path, upgrade = upgrade_requested, "Forwarding HTTP request");

        let (failed_tx, mut send_failed) = oneshot::channel();
        let max_chunk = self.max_chunk;
        let sending = tokio::spawn(async move {
            let result = send_request(header, body, requests, max_chunk, upgrade_requested).await;
            if let Err(status) = &result {
                let _ = failed_tx.send(status.clone());
            }
            result
        });

        let (header_tx, header_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_BUFFER);
        let (upgrade_tx, upgrade_rx) = if upgrade_requested {
            let (tx, rx) = mpsc::channel(BODY_BUFFER);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (drained_tx, drained_rx) = oneshot::channel();
        let mut reader = ResponseReader {
            header: Some(header_tx),
            body: Some(body_tx),
            upgrade: upgrade_tx,
            drained: Some(drained_tx),
            upgrade_requested,
            switching: false,
            empty_body: false,
        };
        let visitor = self.visitor.clone();
        let reading = tokio::spawn(async move {
            let _keep_alive = keep_alive;
            if let Err(status) = visitor.visit(&mut responses, &mut reader).await {
                reader.fail(status).await;
            }
        });

        let head = tokio::select! {
            head = header_rx => match head {
                Ok(head) => head,
                Err(_) => Err(Status::internal("response reader stopped before the Header")),
            },
            Ok(status) = &mut send_failed => Err(status),
        };
        let head = match head.and_then(|head| response_head(head, upgrade_requested)) {
            Ok(head) => head,
            Err(status) => {
                reading.abort();
                sending.abort();
                return Err(status);
            }
        };
        let (status, headers, length) = head;

        let switching = status == StatusCode::SWITCHING_PROTOCOLS;
        let body = if switching {
            ChunkBody::empty()
        } else {
            ChunkBody::new(body_rx, length)
        };
        let mut response = Response::new(body.boxed());
        *response.status_mut() = status;
        *response.headers_mut() = headers;

        match (switching, on_upgrade, upgrade_rx) {
            (true, Some(on_upgrade), Some(inbound)) => {
                tokio::spawn(async move {
                    if let Err(status) = pipe_client(on_upgrade, inbound, sending, max_chunk).await {
                        debug!(error = %status, "Upgraded connection ended with an error");
                    }
                });
            }
            (false, Some(_), _) => {
                // The send side stays open until the response is drained.
                tokio::spawn(async move {
                    let _ = drained_rx.await;
                    if let Ok(Ok(Some(requests))) = sending.await {
                        let _ = requests.close().await;
                    }
                });
            }
            _ => {}
        }
        Ok(response)
    }
}

fn response_head(
    head: ResponseHeader,
    upgrade_requested: bool,
) -> Result<(StatusCode, http::HeaderMap, Option<u64>), Status> {
    let status = StatusCode::from_u16(head.status_code)
        .map_err(|e| Status::internal(format!("invalid response status {}: {e}", head.status_code)))?;
    let switching = status == StatusCode::SWITCHING_PROTOCOLS;
    if switching && !upgrade_requested {
        return Err(Status::internal(format!(
            "unexpected status code {} for non-upgrade request",
            head.status_code
        )));
    }
    let mut headers = headers_from_values(&head.header).map_err(|s| Status::internal(s.message))?;
    strip_hop_by_hop(&mut headers, switching);
    let length = head.content_length.and_then(|n| u64::try_from(n).ok());
    Ok((status, headers, length))
}

/// Sends Header, body chunks and Trailer. The sink is handed back open when
/// the request asked for an upgrade.
async fn send_request<B>(
    header: RequestHeader,
    mut body: B,
    mut requests: FrameSink<HttpRequest>,
    max_chunk: usize,
    keep_open: bool,
) -> SendResult
where
    B: Body<Data = Bytes> + Send + Unpin,
    B::Error: Display + Send,
{
    let empty = header.content_length == Some(0);
    requests.send(HttpRequest::Header(header)).await?;
    if !empty {
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| Status::cancelled(format!("read request body: {e}")))?;
            if let Ok(data) = frame.into_data() {
                for data in chunks(data, max_chunk) {
                    requests
                        .send(HttpRequest::BodyChunk(BodyChunk { data }))
                        .await?;
                }
            }
        }
    }
    requests.send(HttpRequest::Trailer(Trailer {})).await?;
    if keep_open {
        Ok(Some(requests))
    } else {
        requests.close().await?;
        Ok(None)
    }
}

async fn pipe_client(
    on_upgrade: OnUpgrade,
    inbound: mpsc::Receiver<Bytes>,
    sending: JoinHandle<SendResult>,
    max_chunk: usize,
) -> Result<(), Status> {
    let requests = match sending.await {
        Ok(Ok(Some(requests))) => requests,
        Ok(Ok(None)) => return Err(Status::internal("request stream was already closed")),
        Ok(Err(status)) => return Err(status),
        Err(err) => return Err(Status::internal(format!("request sender failed: {err}"))),
    };
    let upgraded = on_upgrade
        .await
        .map_err(|e| Status::unavailable(format!("client upgrade failed: {e}")))?;
    debug!("Client connection upgraded");
    pipe_upgraded(
        TokioIo::new(upgraded),
        inbound,
        requests,
        max_chunk,
        |data| HttpRequest::UpgradeChunk(UpgradeChunk { data }),
    )
    .await
}
