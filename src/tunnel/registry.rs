use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{lock, AgentInfo, ForwardVisitor, Tunnel, TunnelConn, TunnelState};
use crate::error::Status;
use crate::framing::visitor::VisitorError;

/// Idle tunnels of every connected agent, keyed by agent id.
#[derive(Clone)]
pub struct TunnelRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    tunnels: Mutex<HashMap<String, Vec<Arc<Tunnel>>>>,
    ready: Notify,
    next_id: AtomicU64,
    visitor: Arc<ForwardVisitor>,
}

/// Per-agent view served by the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentSummary {
    pub agent_id: String,
    pub services: Vec<String>,
    pub idle_tunnels: usize,
    pub busy_tunnels: usize,
}

impl TunnelRegistry {
    pub fn new() -> Result<Self, VisitorError> {
        Ok(Self {
            inner: Arc::new(Inner {
                tunnels: Mutex::new(HashMap::new()),
                ready: Notify::new(),
                next_id: AtomicU64::new(1),
                visitor: Arc::new(Tunnel::forward_visitor()?),
            }),
        })
    }

    /// Creates a tunnel whose claim and release are tracked by this registry.
    /// It is not discoverable until [`register`](Self::register) is called.
    pub fn new_tunnel(
        &self,
        agent: AgentInfo,
        conn: TunnelConn,
        ctx: CancellationToken,
    ) -> (Arc<Tunnel>, oneshot::Receiver<Option<Status>>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.inner);
        let on_release = move |tunnel: &Tunnel| {
            let end = if tunnel.context().is_cancelled() {
                TunnelState::ContextDone
            } else {
                TunnelState::Done
            };
            let _ = tunnel.transition(&[TunnelState::Forwarding], end);
            if let Some(inner) = weak.upgrade() {
                inner.remove(tunnel);
            }
        };
        let (tunnel, ret) = Tunnel::new(
            id,
            agent,
            conn,
            ctx,
            self.inner.visitor.clone(),
            Box::new(claim),
            Box::new(on_release),
        );
        (Arc::new(tunnel), ret)
    }

    pub fn register(&self, tunnel: Arc<Tunnel>) {
        debug!(tunnel = tunnel.id(), agent = %tunnel.agent().agent_id, "Registering tunnel");
        lock(&self.inner.tunnels)
            .entry(tunnel.agent().agent_id.clone())
            .or_default()
            .push(tunnel);
        self.inner.ready.notify_waiters();
    }

    /// Takes a tunnel out of circulation when its connection goes away before
    /// anyone claimed it. A tunnel that is already forwarding is left alone.
    pub fn unregister(&self, tunnel: &Tunnel) -> bool {
        let stopped = tunnel
            .transition(
                &[TunnelState::Ready, TunnelState::Found],
                TunnelState::ContextDone,
            )
            .is_ok();
        self.inner.remove(tunnel);
        stopped
    }

    /// Hands out an idle tunnel of `agent_id`, waiting up to `timeout` for one
    /// to show up. Each tunnel is handed out at most once.
    pub async fn find_tunnel(&self, agent_id: &str, timeout: Duration) -> Result<Arc<Tunnel>, Status> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(tunnel) = self.inner.take_ready(agent_id) {
                debug!(tunnel = tunnel.id(), agent = %agent_id, "Found tunnel");
                return Ok(tunnel);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Status::unavailable(format!(
                    "no tunnel available for agent {agent_id}"
                )));
            }
        }
    }

    pub fn agents(&self) -> Vec<AgentSummary> {
        let tunnels = lock(&self.inner.tunnels);
        let mut agents: Vec<AgentSummary> = tunnels
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(agent_id, list)| {
                let idle = list
                    .iter()
                    .filter(|t| t.state() == TunnelState::Ready)
                    .count();
                AgentSummary {
                    agent_id: agent_id.clone(),
                    services: list[0].agent().services.clone(),
                    idle_tunnels: idle,
                    busy_tunnels: list.len() - idle,
                }
            })
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Closes every registered tunnel.
    pub fn close_all(&self) {
        let tunnels: Vec<Arc<Tunnel>> = lock(&self.inner.tunnels)
            .drain()
            .flat_map(|(_, list)| list)
            .collect();
        if !tunnels.is_empty() {
            info!("Closing {} idle tunnels", tunnels.len());
        }
        for tunnel in tunnels {
            let _ = tunnel.transition(
                &[TunnelState::Ready, TunnelState::Found],
                TunnelState::ContextDone,
            );
            tunnel.context().cancel();
        }
    }
}

fn claim(tunnel: &Tunnel) -> Result<(), Status> {
    tunnel
        .transition(&[TunnelState::Found], TunnelState::Forwarding)
        .map_err(|state| {
            Status::unavailable(format!("tunnel cannot be claimed in state {state:?}"))
        })
}

impl Inner {
    fn take_ready(&self, agent_id: &str) -> Option<Arc<Tunnel>> {
        let tunnels = lock(&self.tunnels);
        let list = tunnels.get(agent_id)?;
        list.iter()
            .find(|tunnel| {
                tunnel
                    .transition(&[TunnelState::Ready], TunnelState::Found)
                    .is_ok()
            })
            .cloned()
    }

    fn remove(&self, tunnel: &Tunnel) {
        let mut tunnels = lock(&self.tunnels);
        let agent_id = &tunnel.agent().agent_id;
        if let Some(list) = tunnels.get_mut(agent_id) {
            list.retain(|t| t.id() != tunnel.id());
            if list.is_empty() {
                tunnels.remove(agent_id);
            }
        }
    }
}
