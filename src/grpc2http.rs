//! Agent side of a proxied HTTP call.
//!
//! Request frames are turned into a real HTTP request to the upstream service;
//! the upstream response is framed back onto the same stream, headers first.
//! After a `101 Switching Protocols` both connections are joined and raw bytes
//! flow as `UpgradeChunk` frames until either side closes.

use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, HOST};
use http::{Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::sync::{mpsc, oneshot};
use tower::{Service, ServiceExt};
use tracing::debug;
use url::Url;

use crate::error::{Code, ErrReporter, Status};
use crate::framing::visitor::{StreamVisitor, VisitorError};
use crate::framing::Oneof;
use crate::http::{
    chunks, encode_query, headers_from_values, pipe_upgraded, strip_hop_by_hop,
    values_from_headers, ChunkBody,
};
use crate::proto::{
    http_field, BodyChunk, HttpRequest, HttpResponse, Impersonation, RequestHeader,
    ResponseHeader, Trailer, UpgradeChunk,
};
use crate::rpc::{FrameSink, FrameStream};

/// Frames buffered between the request reader and the upstream call.
const BODY_BUFFER: usize = 16;

/// Production upstream client.
pub type UpstreamClient = Client<HttpConnector, ChunkBody>;

pub fn upstream_client() -> UpstreamClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// What the request reader task feeds while the upstream call runs.
pub struct RequestReader {
    body: Option<mpsc::Sender<Result<Bytes, Status>>>,
    upgrade: Option<mpsc::Sender<Bytes>>,
    empty_body: bool,
    ended: bool,
}

type RequestVisitor = StreamVisitor<HttpRequest, RequestReader>;

fn on_body_chunk<'c>(reader: &'c mut RequestReader, data: Bytes) -> BoxFuture<'c, Result<(), Status>> {
    async move {
        if reader.empty_body {
            return Err(Status::internal(
                "unexpected BodyChunk for request with content length 0",
            ));
        }
        if let Some(body) = &reader.body {
            // The upstream call may have stopped reading the body already.
            let _ = body.send(Ok(data)).await;
        }
        Ok(())
    }
    .boxed()
}

fn on_trailer<'c>(reader: &'c mut RequestReader, _: Trailer) -> BoxFuture<'c, Result<(), Status>> {
    reader.body = None;
    reader.ended = true;
    future::ready(Ok(())).boxed()
}

fn on_upgrade_chunk<'c>(reader: &'c mut RequestReader, data: Bytes) -> BoxFuture<'c, Result<(), Status>> {
    async move {
        match &reader.upgrade {
            Some(upgrade) => {
                let _ = upgrade.send(data).await;
                Ok(())
            }
            None => Err(Status::internal(
                "unexpected UpgradeData for non-upgrade request",
            )),
        }
    }
    .boxed()
}

/// A request that ends without its Trailer was cut short, even when the body
/// it declared is complete. The upstream body must fail rather than end.
fn on_eof(reader: &mut RequestReader) -> BoxFuture<'_, Result<(), Status>> {
    async move {
        reader.upgrade = None;
        if reader.ended {
            return Ok(());
        }
        let status = Status::internal("request stream ended before its Trailer");
        if let Some(body) = reader.body.take() {
            let _ = body.send(Err(status.clone())).await;
        }
        Err(status)
    }
    .boxed()
}

/// Performs framed HTTP requests against one upstream base URL.
pub struct GrpcToHttp<S = UpstreamClient> {
    service: S,
    upstream: Url,
    bearer_token: Option<String>,
    max_chunk: usize,
    reporter: Arc<dyn ErrReporter>,
    visitor: Arc<RequestVisitor>,
}

impl<S, B> GrpcToHttp<S>
where
    S: Service<Request<ChunkBody>, Response = Response<B>> + Clone + Send + Sync + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
    S::Future: Send,
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Display,
{
    pub fn new(
        service: S,
        upstream: Url,
        max_chunk: usize,
        reporter: Arc<dyn ErrReporter>,
    ) -> Result<Self, VisitorError> {
        let visitor = StreamVisitor::builder()
            .start_at(http_field::HEADER)
            .on_data(http_field::BODY_CHUNK, on_body_chunk)
            .on::<Trailer, _>(on_trailer)
            .on_data(http_field::UPGRADE_CHUNK, on_upgrade_chunk)
            .on_eof(on_eof)
            .build()?;
        Ok(Self {
            service,
            upstream,
            bearer_token: None,
            max_chunk: max_chunk.max(1),
            reporter,
            visitor: Arc::new(visitor),
        })
    }

    /// Sent as `Authorization: Bearer <token>` on every upstream request.
    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }

    /// Serves one HTTP call. `responses` is dropped on return; the caller
    /// closes the surrounding stream.
    pub async fn handle(
        &self,
        mut requests: FrameStream<HttpRequest>,
        responses: FrameSink<HttpResponse>,
    ) -> Result<(), Status> {
        let header = match requests.recv().await? {
            Some(HttpRequest::Header(header)) => header,
            Some(other) => {
                return Err(Status::internal(format!(
                    "expected request Header, got field {}",
                    other.field_number()
                )))
            }
            None => return Err(Status::internal("request stream ended before its Header")),
        };
        let upgrade = header.is_upgrade();
        let empty_body = header.content_length == Some(0);
        debug!(method = %header.method, path = %header.url_path, upgrade, "Handling HTTP request");

        let (body, body_tx) = if empty_body {
            (ChunkBody::empty(), None)
        } else {
            let (tx, rx) = mpsc::channel(BODY_BUFFER);
            let length = header.content_length.and_then(|n| u64::try_from(n).ok());
            (ChunkBody::new(rx, length), Some(tx))
        };
        let (upgrade_tx, upgrade_rx) = if upgrade {
            let (tx, rx) = mpsc::channel(BODY_BUFFER);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let request = self.build_request(header, body)?;

        let (failed_tx, mut failed) = oneshot::channel();
        let visitor = self.visitor.clone();
        let mut reader = RequestReader {
            body: body_tx,
            upgrade: upgrade_tx,
            empty_body,
            ended: false,
        };
        let reading = tokio::spawn(async move {
            let result = visitor.visit(&mut requests, &mut reader).await;
            if let Err(status) = &result {
                if let Some(body) = reader.body.take() {
                    let _ = body.send(Err(status.clone())).await;
                }
                let _ = failed_tx.send(status.clone());
            }
            result
        });

        let exchanged = tokio::select! {
            res = self.exchange(request, upgrade_rx, responses) => res,
            Ok(status) = &mut failed => Err(status),
        };
        match exchanged {
            Ok(false) => {}
            // The upgraded pipe is closed, so nothing the reader still
            // receives matters.
            Ok(true) => {
                reading.abort();
                return Ok(());
            }
            Err(status) => {
                reading.abort();
                return Err(status);
            }
        }
        match reading.await {
            Ok(result) => result,
            Err(err) => Err(Status::internal(format!("request reader failed: {err}"))),
        }
    }

    /// Returns whether the connection was upgraded and piped.
    async fn exchange(
        &self,
        request: Request<ChunkBody>,
        upgrade_rx: Option<mpsc::Receiver<Bytes>>,
        mut responses: FrameSink<HttpResponse>,
    ) -> Result<bool, Status> {
        let mut response = match self.service.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => {
                self.reporter
                    .handle_processing_error("Failed to make the upstream HTTP request", &err);
                return Err(Status::unavailable(format!("upstream request failed: {err}")));
            }
        };

        let status = response.status();
        let switching = status == StatusCode::SWITCHING_PROTOCOLS;
        if switching && upgrade_rx.is_none() {
            return Err(Status::internal(format!(
                "unexpected status code {} for non-upgrade request",
                status.as_u16()
            )));
        }

        responses
            .send(HttpResponse::Header(ResponseHeader {
                status_code: status.as_u16(),
                status: status.canonical_reason().unwrap_or_default().to_string(),
                header: values_from_headers(response.headers()),
                content_length: response
                    .body()
                    .size_hint()
                    .exact()
                    .and_then(|n| i64::try_from(n).ok()),
            }))
            .await?;

        while let Some(frame) = response.body_mut().frame().await {
            let frame = frame
                .map_err(|e| Status::unavailable(format!("read upstream response body: {e}")))?;
            if let Ok(data) = frame.into_data() {
                for data in chunks(data, self.max_chunk) {
                    responses
                        .send(HttpResponse::BodyChunk(BodyChunk { data }))
                        .await?;
                }
            }
        }
        responses.send(HttpResponse::Trailer(Trailer {})).await?;

        if let (true, Some(inbound)) = (switching, upgrade_rx) {
            let upgraded = hyper::upgrade::on(&mut response)
                .await
                .map_err(|e| Status::unavailable(format!("upstream upgrade failed: {e}")))?;
            debug!("Upstream connection upgraded");
            pipe_upgraded(
                TokioIo::new(upgraded),
                inbound,
                responses,
                self.max_chunk,
                |data| HttpResponse::UpgradeChunk(UpgradeChunk { data }),
            )
            .await?;
            return Ok(true);
        }
        Ok(false)
    }

    fn build_request(
        &self,
        header: RequestHeader,
        body: ChunkBody,
    ) -> Result<Request<ChunkBody>, Status> {
        let invalid = |msg: String| Status::new(Code::InvalidArgument, msg);
        let upgrade = header.is_upgrade();
        let method = Method::from_bytes(header.method.as_bytes())
            .map_err(|e| invalid(format!("invalid method {:?}: {e}", header.method)))?;

        let mut url = self.upstream.clone();
        let base = self.upstream.path().trim_end_matches('/');
        url.set_path(&format!("{base}/{}", header.url_path.trim_start_matches('/')));
        let query = encode_query(&header.query);
        url.set_query((!query.is_empty()).then_some(query.as_str()));

        let mut headers = headers_from_values(&header.header)?;
        strip_hop_by_hop(&mut headers, upgrade);
        headers.remove(HOST);
        if let Some(extra) = &header.extra {
            impersonate(&mut headers, &Impersonation::from_typed_value(extra)?)?;
        }
        if let Some(token) = &self.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| invalid(format!("invalid upstream token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let mut request = Request::builder()
            .method(method)
            .uri(url.as_str())
            .body(body)
            .map_err(|e| invalid(format!("invalid upstream request: {e}")))?;
        *request.headers_mut() = headers;
        Ok(request)
    }
}

/// Replaces any caller-supplied `Impersonate-*` fields with `who`.
fn impersonate(headers: &mut HeaderMap, who: &Impersonation) -> Result<(), Status> {
    let stale: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("impersonate-"))
        .cloned()
        .collect();
    for name in stale {
        headers.remove(name);
    }

    let mut add = |name: &str, value: &str| -> Result<(), Status> {
        let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
            .map_err(|e| Status::new(Code::InvalidArgument, format!("invalid header {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Status::new(Code::InvalidArgument, format!("invalid value for {name}: {e}")))?;
        headers.append(name, value);
        Ok(())
    };
    if let Some(user) = &who.user {
        add("impersonate-user", user)?;
    }
    for group in &who.groups {
        add("impersonate-group", group)?;
    }
    if let Some(uid) = &who.uid {
        add("impersonate-uid", uid)?;
    }
    for (key, values) in &who.extra {
        for value in values {
            add(&format!("impersonate-extra-{key}"), value)?;
        }
    }
    Ok(())
}
