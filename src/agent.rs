//! In-cluster side: keeps a pool of idle tunnels open to the control plane
//! and serves one proxied call on each.

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::AgentConfig;
use crate::error::{ErrReporter, LogReporter, Status};
use crate::framing::visitor::{StreamVisitor, VisitorError};
use crate::framing::Oneof;
use crate::grpc2http::{upstream_client, GrpcToHttp};
use crate::proto::{
    request_field, AgentDescriptor, CallError, CallHeader, CallTrailer, CloseSend,
    ConnectRequest, ConnectResponse, HttpRequest, HttpResponse, RawMessage, RequestInfo,
    HTTP_METHOD,
};
use crate::rpc::{pipe, FrameSink, FrameStream, Metadata};
use crate::transport;

/// Frames buffered between the connection and the call handler.
const CALL_BUFFER: usize = 16;

/// Feeds the raw request frames of a call to its handler.
pub struct RequestRelay {
    tx: Option<mpsc::Sender<Result<Bytes, Status>>>,
}

type RelayVisitor = StreamVisitor<ConnectRequest, RequestRelay>;

fn relay_visitor() -> Result<RelayVisitor, VisitorError> {
    StreamVisitor::builder()
        .start_at(request_field::REQUEST_INFO)
        .on_data(request_field::MESSAGE, on_message)
        .on::<CloseSend, _>(on_close_send)
        .on_eof(on_eof)
        .build()
}

fn on_message<'c>(relay: &'c mut RequestRelay, data: Bytes) -> BoxFuture<'c, Result<(), Status>> {
    async move {
        if let Some(tx) = &relay.tx {
            // The handler may be done with the request already.
            let _ = tx.send(Ok(data)).await;
        }
        Ok(())
    }
    .boxed()
}

fn on_close_send<'c>(relay: &'c mut RequestRelay, _: CloseSend) -> BoxFuture<'c, Result<(), Status>> {
    relay.tx = None;
    future::ready(Ok(())).boxed()
}

fn on_eof(relay: &mut RequestRelay) -> BoxFuture<'_, Result<(), Status>> {
    async move {
        let Some(tx) = relay.tx.take() else {
            return Ok(());
        };
        let status = Status::unavailable("server closed the call without CloseSend");
        let _ = tx.send(Err(status.clone())).await;
        Err(status)
    }
    .boxed()
}

/// Capped exponential backoff shared by all connection attempts.
struct Backoff {
    initial: Duration,
    max: Duration,
    next: Mutex<Duration>,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: Mutex::new(initial),
        }
    }

    /// Delay before the next attempt; doubles every time.
    fn failed(&self) -> Duration {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let delay = *next;
        *next = (delay * 2).min(self.max);
        delay
    }

    fn reset(&self) {
        *self.next.lock().unwrap_or_else(PoisonError::into_inner) = self.initial;
    }
}

/// One idle connection counted by the pool until it picks up a call.
struct IdleSlot {
    idle: Arc<watch::Sender<usize>>,
    held: bool,
}

impl IdleSlot {
    fn take(idle: Arc<watch::Sender<usize>>) -> Self {
        idle.send_modify(|n| *n += 1);
        Self { idle, held: true }
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.held) {
            self.idle.send_modify(|n| *n = n.saturating_sub(1));
        }
    }
}

impl Drop for IdleSlot {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct Agent {
    inner: Arc<Inner>,
}

struct Inner {
    server_url: Url,
    descriptor: AgentDescriptor,
    max_frame_length: usize,
    min_idle: usize,
    max_connections: usize,
    http: GrpcToHttp,
    relay: Arc<RelayVisitor>,
    backoff: Backoff,
}

impl Agent {
    pub fn new(config: &AgentConfig, reporter: Arc<dyn ErrReporter>) -> Result<Self> {
        let agent_id = config
            .agent_id
            .clone()
            .context("No agent id configured. Set agent.agent_id or run 'backhaul init'")?;
        let token = config
            .token
            .clone()
            .context("No agent token configured. Run 'backhaul init' first")?;
        let server_url = Url::parse(&config.server_url)
            .with_context(|| format!("Invalid server url: {}", config.server_url))?;
        let upstream = Url::parse(&config.upstream_url)
            .with_context(|| format!("Invalid upstream url: {}", config.upstream_url))?;

        let http = GrpcToHttp::new(upstream_client(), upstream, config.max_chunk_size, reporter)
            .context("Failed to build HTTP adapter")?
            .with_bearer_token(config.upstream_token()?);

        Ok(Self {
            inner: Arc::new(Inner {
                server_url,
                descriptor: AgentDescriptor {
                    agent_id,
                    token,
                    services: vec![HTTP_METHOD.to_string()],
                },
                max_frame_length: config.max_frame_length,
                min_idle: config.min_idle_connections.max(1),
                max_connections: config.max_connections.max(1),
                http,
                relay: Arc::new(relay_visitor().context("Failed to build request relay")?),
                backoff: Backoff::new(config.backoff_initial(), config.backoff_max()),
            }),
        })
    }

    /// Keeps idle tunnels open until `shutdown` is cancelled. Calls already
    /// in flight are left to finish.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let inner = self.inner;
        info!(
            "Agent {} connecting to {}",
            inner.descriptor.agent_id, inner.server_url
        );
        let (idle_tx, mut idle_rx) = watch::channel(0usize);
        let idle = Arc::new(idle_tx);
        let slots = Arc::new(Semaphore::new(inner.max_connections));

        loop {
            let min_idle = inner.min_idle;
            tokio::select! {
                open = idle_rx.wait_for(|n| *n < min_idle).map(|res| res.is_ok()) => {
                    if !open {
                        break;
                    }
                }
                _ = shutdown.cancelled() => break,
            }
            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => permit.context("Connection limit closed")?,
                _ = shutdown.cancelled() => break,
            };

            let mut slot = IdleSlot::take(idle.clone());
            let inner = inner.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(status) = inner.serve_connection(&mut slot, &shutdown).await {
                    if slot.held {
                        let delay = inner.backoff.failed();
                        warn!("Tunnel connection failed: {}; retrying in {:?}", status, delay);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.cancelled() => {}
                        }
                    } else {
                        warn!("Proxied call failed: {}", status);
                    }
                }
            });
        }

        info!("Agent stopped");
        Ok(())
    }
}

/// Runs the agent from its config until Ctrl+C.
pub async fn run_agent(config: &AgentConfig) -> Result<()> {
    let agent = Agent::new(config, Arc::new(LogReporter))?;
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        signal.cancel();
    });
    agent.run(shutdown).await
}

impl Inner {
    /// One pooled connection: handshake, wait for a call, serve it.
    async fn serve_connection(
        &self,
        slot: &mut IdleSlot,
        shutdown: &CancellationToken,
    ) -> Result<(), Status> {
        let conn = transport::connect(&self.server_url, self.max_frame_length).await?;
        let mut requests = conn.reader.decode::<ConnectRequest>();
        let mut responses = conn.writer.encode::<ConnectResponse>();
        responses
            .send(ConnectResponse::Descriptor(self.descriptor.clone()))
            .await?;

        let info = tokio::select! {
            msg = requests.recv() => match msg? {
                Some(ConnectRequest::RequestInfo(info)) => info,
                Some(other) => {
                    return Err(Status::internal(format!(
                        "expected RequestInfo, got field {}",
                        other.field_number()
                    )))
                }
                None => return Err(Status::unavailable("server closed the idle connection")),
            },
            _ = shutdown.cancelled() => return Ok(()),
        };
        // A call means the server accepted this agent.
        self.backoff.reset();
        // Busy now: the pool may open a replacement.
        slot.release();
        self.serve_call(info, requests, responses).await
    }

    /// Answers one call and half-closes `responses`.
    async fn serve_call(
        &self,
        info: RequestInfo,
        mut requests: FrameStream<ConnectRequest>,
        mut responses: FrameSink<ConnectResponse>,
    ) -> Result<(), Status> {
        debug!(method = %info.method_name, "Serving call");
        if info.method_name != HTTP_METHOD {
            let status = Status::unimplemented(format!("unknown method {}", info.method_name));
            responses
                .send(ConnectResponse::Error(CallError { status }))
                .await?;
            return responses.close().await;
        }
        responses
            .send(ConnectResponse::Header(CallHeader {
                meta: Metadata::new(),
            }))
            .await?;

        let (req_tx, req_rx) = mpsc::channel(CALL_BUFFER);
        let relay = self.relay.clone();
        // May outlive the call: the server keeps the connection open until
        // the whole call is answered.
        let relaying = tokio::spawn(async move {
            let mut ctx = RequestRelay { tx: Some(req_tx) };
            if let Err(status) = relay.visit(&mut requests, &mut ctx).await {
                if let Some(tx) = ctx.tx.take() {
                    let _ = tx.send(Err(status)).await;
                }
            }
        });

        let (raw_tx, mut raw_rx) = pipe::<Bytes>(CALL_BUFFER);
        let handled = self.http.handle(
            FrameStream::from_receiver(req_rx).decode::<HttpRequest>(),
            raw_tx.encode::<HttpResponse>(),
        );
        let writing = async move {
            let result = relay_responses(&mut raw_rx, &mut responses).await;
            drop(raw_rx);
            (responses, result)
        };
        let (handled, (mut responses, written)) = tokio::join!(handled, writing);
        relaying.abort();
        written?;

        match handled {
            Ok(()) => {
                responses
                    .send(ConnectResponse::Trailer(CallTrailer {
                        meta: Metadata::new(),
                    }))
                    .await?;
            }
            Err(status) => {
                debug!(error = %status, "Call failed");
                responses
                    .send(ConnectResponse::Error(CallError { status }))
                    .await?;
            }
        }
        responses.close().await
    }
}

async fn relay_responses(
    raw: &mut FrameStream<Bytes>,
    responses: &mut FrameSink<ConnectResponse>,
) -> Result<(), Status> {
    while let Some(data) = raw.recv().await? {
        responses
            .send(ConnectResponse::Message(RawMessage { data }))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::error::Code;
    use crate::transport::TransportKind;

    fn test_agent() -> Agent {
        let config = AgentConfig {
            agent_id: Some("edge-1".to_string()),
            token: Some("s3cret".to_string()),
            ..AgentConfig::default()
        };
        Agent::new(&config, Arc::new(LogReporter)).unwrap()
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.failed(), Duration::from_millis(100));
        assert_eq!(backoff.failed(), Duration::from_millis(200));
        assert_eq!(backoff.failed(), Duration::from_millis(350));
        assert_eq!(backoff.failed(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.failed(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn backoff_grows_until_a_call_arrives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Hangs up on three handshakes, then sends a call on the fourth.
        let server = tokio::spawn(async move {
            for attempt in 0..4 {
                let (stream, _) = listener.accept().await.unwrap();
                let conn = transport::accept(stream, TransportKind::Tcp, 1 << 20)
                    .await
                    .unwrap();
                let mut reader = conn.reader.decode::<ConnectResponse>();
                let mut writer = conn.writer.encode::<ConnectRequest>();
                assert!(matches!(
                    reader.recv().await.unwrap(),
                    Some(ConnectResponse::Descriptor(_))
                ));
                if attempt == 3 {
                    writer
                        .send(ConnectRequest::RequestInfo(RequestInfo {
                            method_name: "/other.Service/Call".to_string(),
                            meta: Metadata::new(),
                        }))
                        .await
                        .unwrap();
                    while let Ok(Some(_)) = reader.recv().await {}
                }
            }
        });

        let config = AgentConfig {
            agent_id: Some("edge-1".to_string()),
            token: Some("s3cret".to_string()),
            server_url: format!("tcp://{addr}"),
            backoff_initial_ms: 100,
            backoff_max_ms: 1000,
            ..AgentConfig::default()
        };
        let agent = Agent::new(&config, Arc::new(LogReporter)).unwrap();
        let idle = Arc::new(watch::channel(0usize).0);
        let shutdown = CancellationToken::new();

        let mut delays = Vec::new();
        for _ in 0..3 {
            let mut slot = IdleSlot::take(idle.clone());
            assert!(agent.inner.serve_connection(&mut slot, &shutdown).await.is_err());
            assert!(slot.held);
            delays.push(agent.inner.backoff.failed());
        }
        assert_eq!(
            delays,
            [100, 200, 400].map(Duration::from_millis)
        );

        let mut slot = IdleSlot::take(idle);
        agent
            .inner
            .serve_connection(&mut slot, &shutdown)
            .await
            .unwrap();
        assert!(!slot.held);
        assert_eq!(agent.inner.backoff.failed(), Duration::from_millis(100));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn missing_close_send_fails_the_request() {
        let visitor = relay_visitor().unwrap();
        let (mut tx, mut requests) = pipe::<ConnectRequest>(4);
        for data in [&b"a"[..], &b"b"[..]] {
            tx.send(ConnectRequest::Message(RawMessage {
                data: Bytes::from_static(data),
            }))
            .await
            .unwrap();
        }
        tx.close().await.unwrap();

        // One slot: the failure must wait for room rather than be dropped.
        let (relay_tx, mut relay_rx) = mpsc::channel(1);
        let visiting = tokio::spawn(async move {
            let mut relay = RequestRelay { tx: Some(relay_tx) };
            visitor.visit(&mut requests, &mut relay).await
        });

        assert_eq!(relay_rx.recv().await.unwrap().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(relay_rx.recv().await.unwrap().unwrap(), Bytes::from_static(b"b"));
        let err = relay_rx.recv().await.unwrap().unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        assert!(relay_rx.recv().await.is_none());
        assert_eq!(visiting.await.unwrap().unwrap_err().code(), Code::Unavailable);
    }

    #[test]
    fn idle_slot_is_released_once() {
        let (tx, rx) = watch::channel(0usize);
        let idle = Arc::new(tx);
        let mut slot = IdleSlot::take(idle.clone());
        let other = IdleSlot::take(idle);
        assert_eq!(*rx.borrow(), 2);
        slot.release();
        slot.release();
        assert_eq!(*rx.borrow(), 1);
        drop(slot);
        assert_eq!(*rx.borrow(), 1);
        drop(other);
        assert_eq!(*rx.borrow(), 0);
    }

    #[test]
    fn missing_identity_is_a_config_error() {
        let err = Agent::new(&AgentConfig::default(), Arc::new(LogReporter))
            .err()
            .unwrap();
        assert!(err.to_string().contains("agent id"));
    }

    #[tokio::test]
    async fn unknown_method_is_unimplemented() {
        let agent = test_agent();
        let (_requests_tx, requests) = pipe::<ConnectRequest>(4);
        let (responses, mut out) = pipe::<ConnectResponse>(4);
        let info = RequestInfo {
            method_name: "/other.Service/Call".to_string(),
            meta: Metadata::new(),
        };
        agent
            .inner
            .serve_call(info, requests, responses)
            .await
            .unwrap();

        match out.recv().await.unwrap() {
            Some(ConnectResponse::Error(err)) => {
                assert_eq!(err.status.code(), Code::Unimplemented)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(out.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn refused_upstream_ends_with_an_error_frame() {
        // Nothing listens on the default upstream port in tests.
        let config = AgentConfig {
            agent_id: Some("edge-1".to_string()),
            token: Some("s3cret".to_string()),
            upstream_url: "http://127.0.0.1:1".to_string(),
            ..AgentConfig::default()
        };
        let agent = Agent::new(&config, Arc::new(LogReporter)).unwrap();

        let (mut requests_tx, requests) = pipe::<ConnectRequest>(8);
        let (responses, mut out) = pipe::<ConnectResponse>(8);
        let frames = [
            HttpRequest::Header(crate::proto::RequestHeader {
                method: "GET".to_string(),
                url_path: "/".to_string(),
                query: Default::default(),
                header: Default::default(),
                extra: None,
                content_length: Some(0),
            }),
            HttpRequest::Trailer(crate::proto::Trailer {}),
        ];
        for frame in frames {
            requests_tx
                .send(ConnectRequest::Message(RawMessage {
                    data: frame.encode().unwrap(),
                }))
                .await
                .unwrap();
        }
        requests_tx
            .send(ConnectRequest::CloseSend(CloseSend {}))
            .await
            .unwrap();

        let info = RequestInfo {
            method_name: HTTP_METHOD.to_string(),
            meta: Metadata::new(),
        };
        agent
            .inner
            .serve_call(info, requests, responses)
            .await
            .unwrap();

        assert!(matches!(
            out.recv().await.unwrap(),
            Some(ConnectResponse::Header(_))
        ));
        match out.recv().await.unwrap() {
            Some(ConnectResponse::Error(err)) => assert_eq!(err.status.code(), Code::Unavailable),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(out.recv().await.unwrap(), None);
    }
}
