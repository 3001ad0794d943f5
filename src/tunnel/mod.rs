//! One agent connection and the lifecycle of borrowing it for a call.
//!
//! A [`Tunnel`] is created by the handler that owns the agent's connection and
//! handed to a [`TunnelRegistry`]. A proxy borrows it for exactly one
//! [`Tunnel::forward_stream`]; the outcome goes back to the owning handler
//! through a single-slot channel.

pub mod registry;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Status;
use crate::framing::visitor::{StreamVisitor, VisitorError};
use crate::framing::Oneof;
use crate::proto::{
    response_field, CallError, CallHeader, CallTrailer, CloseSend, ConnectRequest,
    ConnectResponse, RawMessage, RequestInfo,
};
use crate::rpc::{ForwardCallbacks, FrameSink, FrameStream, IncomingStream, Metadata};

pub use registry::{AgentSummary, TunnelRegistry};

/// Decoded halves of an agent connection, after the descriptor was read.
pub struct TunnelConn {
    pub reader: FrameStream<ConnectResponse>,
    pub writer: FrameSink<ConnectRequest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    /// Registered and discoverable.
    Ready,
    /// Handed to one caller, not forwarding yet.
    Found,
    Forwarding,
    /// Forwarding finished and the tunnel was released.
    Done,
    /// The tunnel's own connection context ended.
    ContextDone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub services: Vec<String>,
}

pub type ClaimHook = Box<dyn Fn(&Tunnel) -> Result<(), Status> + Send + Sync>;
pub type ReleaseHook = Box<dyn Fn(&Tunnel) + Send + Sync>;

/// Receives what the agent sends while forwarding.
pub type ForwardVisitor = StreamVisitor<ConnectResponse, Outbound>;

/// How an idle tunnel stopped being idle.
#[derive(Debug)]
pub enum IdleOutcome {
    Claimed,
    Closed(Option<Status>),
}

pub struct Tunnel {
    id: u64,
    agent: AgentInfo,
    state: Mutex<TunnelState>,
    conn: tokio::sync::Mutex<Option<TunnelConn>>,
    claimed: Notify,
    ret: Mutex<Option<oneshot::Sender<Option<Status>>>>,
    ctx: CancellationToken,
    visitor: Arc<ForwardVisitor>,
    on_claim: ClaimHook,
    on_release: ReleaseHook,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Tunnel {
    /// Creates a Ready tunnel. The receiver gets the tunnel-side outcome of the
    /// one forward that uses it.
    pub fn new(
        id: u64,
        agent: AgentInfo,
        conn: TunnelConn,
        ctx: CancellationToken,
        visitor: Arc<ForwardVisitor>,
        on_claim: ClaimHook,
        on_release: ReleaseHook,
    ) -> (Self, oneshot::Receiver<Option<Status>>) {
        let (ret_tx, ret_rx) = oneshot::channel();
        let tunnel = Self {
            id,
            agent,
            state: Mutex::new(TunnelState::Ready),
            conn: tokio::sync::Mutex::new(Some(conn)),
            claimed: Notify::new(),
            ret: Mutex::new(Some(ret_tx)),
            ctx,
            visitor,
            on_claim,
            on_release,
        };
        (tunnel, ret_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn agent(&self) -> &AgentInfo {
        &self.agent
    }

    pub fn state(&self) -> TunnelState {
        *lock(&self.state)
    }

    pub fn context(&self) -> &CancellationToken {
        &self.ctx
    }

    /// Moves to `to` if the current state is one of `from`; otherwise returns
    /// the current state.
    pub fn transition(&self, from: &[TunnelState], to: TunnelState) -> Result<(), TunnelState> {
        let mut state = lock(&self.state);
        if from.contains(&state) {
            *state = to;
            Ok(())
        } else {
            Err(*state)
        }
    }

    /// Builds the visitor used for the agent's half of a forward.
    pub fn forward_visitor() -> Result<ForwardVisitor, VisitorError> {
        StreamVisitor::builder()
            .start_at(response_field::DESCRIPTOR)
            .on::<CallHeader, _>(|out: &mut Outbound, header: CallHeader| {
                out.callbacks.header(header.meta)
            })
            .on_data(response_field::MESSAGE, |out: &mut Outbound, data: Bytes| {
                out.callbacks.message(data)
            })
            .on::<CallTrailer, _>(|out: &mut Outbound, trailer: CallTrailer| {
                out.callbacks.trailer(trailer.meta)
            })
            .on::<CallError, _>(on_error)
            .build()
    }

    /// Waits while the tunnel is idle. Returns once a caller claims it, or when
    /// the agent's connection ends or misbehaves first.
    pub async fn watch_idle(&self) -> IdleOutcome {
        let mut conn = self.conn.lock().await;
        let Some(conn) = conn.as_mut() else {
            return IdleOutcome::Claimed;
        };
        tokio::select! {
            _ = self.claimed.notified() => IdleOutcome::Claimed,
            res = conn.reader.recv() => match res {
                Ok(None) => IdleOutcome::Closed(None),
                Ok(Some(msg)) => IdleOutcome::Closed(Some(Status::internal(format!(
                    "unexpected field number received from idle agent: {}",
                    msg.field_number()
                )))),
                Err(status) => IdleOutcome::Closed(Some(status)),
            },
            _ = self.ctx.cancelled() => IdleOutcome::Closed(None),
        }
    }

    /// Pipes `incoming` through this tunnel.
    ///
    /// The request direction relays a `RequestInfo`, every raw frame of
    /// `incoming`, then `CloseSend`. The response direction dispatches the
    /// agent's frames to `callbacks`. The tunnel-side result is reported to the
    /// owning handler exactly once; the caller-side result is returned.
    pub async fn forward_stream(
        &self,
        incoming: IncomingStream,
        callbacks: Arc<dyn ForwardCallbacks>,
    ) -> Result<(), Status> {
        (self.on_claim)(self)?;
        let mut guard = ForwardGuard {
            tunnel: self,
            for_tunnel: Some(Status::cancelled("forwarding was abandoned")),
        };
        self.claimed.notify_one();

        let conn = self.conn.lock().await.take();
        let Some(TunnelConn { reader, writer }) = conn else {
            let status = Status::internal("tunnel connection was already taken");
            guard.for_tunnel = Some(status.clone());
            return Err(status);
        };
        let IncomingStream {
            method,
            metadata,
            frames,
            cancel,
        } = incoming;
        debug!(tunnel = self.id, agent = %self.agent.agent_id, method = %method, "Forwarding stream");

        let (results_tx, mut results) = mpsc::channel::<ErrPair>(2);

        let ctx = self.ctx.clone();
        let tx = results_tx.clone();
        let inbound = tokio::spawn(async move {
            let pair = tokio::select! {
                pair = pump_incoming(method, metadata, frames, writer) => pair,
                _ = ctx.cancelled() => ErrPair::both(Status::unavailable("tunnel connection closed")),
            };
            let _ = tx.send(pair).await;
        });

        let ctx = self.ctx.clone();
        let tx = results_tx;
        let visitor = self.visitor.clone();
        let outbound = tokio::spawn(async move {
            let pair = tokio::select! {
                pair = pump_tunnel(&visitor, reader, callbacks) => pair,
                _ = ctx.cancelled() => ErrPair::both(Status::unavailable("tunnel connection closed")),
            };
            let _ = tx.send(pair).await;
        });

        let pair = tokio::select! {
            _ = cancel.cancelled() => ErrPair::cancelled(),
            first = results.recv() => match first {
                Some(pair) if pair.is_err() => pair,
                Some(_) => tokio::select! {
                    _ = cancel.cancelled() => ErrPair::cancelled(),
                    second = results.recv() => second.unwrap_or_else(ErrPair::lost),
                },
                None => ErrPair::lost(),
            },
        };
        inbound.abort();
        outbound.abort();

        debug!(tunnel = self.id, for_tunnel = ?pair.for_tunnel, for_incoming = ?pair.for_incoming, "Forwarding finished");
        guard.for_tunnel = pair.for_tunnel;
        drop(guard);
        match pair.for_incoming {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn report(&self, result: Option<Status>) {
        if let Some(ret) = lock(&self.ret).take() {
            let _ = ret.send(result);
        }
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("agent", &self.agent)
            .field("state", &self.state())
            .finish()
    }
}

/// Reports the tunnel-side result and releases the tunnel exactly once, on
/// every exit path of a forward that got past its claim.
struct ForwardGuard<'a> {
    tunnel: &'a Tunnel,
    for_tunnel: Option<Status>,
}

impl Drop for ForwardGuard<'_> {
    fn drop(&mut self) {
        self.tunnel.report(self.for_tunnel.take());
        (self.tunnel.on_release)(self.tunnel);
    }
}

/// Per-forward state of the response direction.
pub struct Outbound {
    callbacks: Arc<dyn ForwardCallbacks>,
    error: Option<Status>,
}

fn on_error<'c>(out: &'c mut Outbound, err: CallError) -> BoxFuture<'c, Result<(), Status>> {
    // Keep consuming: the agent still closes the stream after an Error frame.
    out.error = Some(out.callbacks.error(err.status));
    future::ready(Ok(())).boxed()
}

#[derive(Debug, Default)]
struct ErrPair {
    for_tunnel: Option<Status>,
    for_incoming: Option<Status>,
}

impl ErrPair {
    fn both(status: Status) -> Self {
        Self {
            for_tunnel: Some(status.clone()),
            for_incoming: Some(status),
        }
    }

    fn cancelled() -> Self {
        Self::both(Status::cancelled("incoming stream closed"))
    }

    fn lost() -> Self {
        Self::both(Status::internal("forwarding task stopped unexpectedly"))
    }

    fn is_err(&self) -> bool {
        self.for_tunnel.is_some() || self.for_incoming.is_some()
    }
}

async fn pump_incoming(
    method: String,
    metadata: Metadata,
    mut frames: FrameStream<Bytes>,
    mut writer: FrameSink<ConnectRequest>,
) -> ErrPair {
    let info = ConnectRequest::RequestInfo(RequestInfo {
        method_name: method,
        meta: metadata,
    });
    if let Err(status) = writer.send(info).await {
        return ErrPair::both(status);
    }
    loop {
        match frames.recv().await {
            Ok(Some(data)) => {
                if let Err(status) = writer.send(ConnectRequest::Message(RawMessage { data })).await {
                    return ErrPair::both(status);
                }
            }
            Ok(None) => break,
            Err(status) => {
                return ErrPair {
                    for_tunnel: Some(Status::cancelled("read from incoming stream failed")),
                    for_incoming: Some(status),
                }
            }
        }
    }
    match writer.send(ConnectRequest::CloseSend(CloseSend {})).await {
        Ok(()) => ErrPair::default(),
        Err(status) => ErrPair::both(status),
    }
}

async fn pump_tunnel(
    visitor: &ForwardVisitor,
    mut reader: FrameStream<ConnectResponse>,
    callbacks: Arc<dyn ForwardCallbacks>,
) -> ErrPair {
    let mut out = Outbound {
        callbacks,
        error: None,
    };
    match visitor.visit(&mut reader, &mut out).await {
        Ok(()) => ErrPair {
            for_tunnel: None,
            for_incoming: out.error,
        },
        Err(status) => ErrPair::both(status),
    }
}
