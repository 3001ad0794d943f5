use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Auth, Config, ServerConfig};
use crate::error::Status;
use crate::framing::Oneof;
use crate::http::full_body;
use crate::http2grpc::HttpToGrpc;
use crate::proto::{AgentDescriptor, ConnectRequest, ConnectResponse};
use crate::proxy::{handle_proxy_request, ProxyAuthorizer, ProxyState, StaticAuthorizer};
use crate::transport;
use crate::tunnel::{AgentInfo, IdleOutcome, TunnelConn, TunnelRegistry};

type AdminBody = BoxBody<Bytes, hyper::Error>;

/// Decides whether a connecting agent is who it claims to be.
#[async_trait]
pub trait AgentAuthenticator: Send + Sync {
    async fn authenticate(&self, descriptor: &AgentDescriptor) -> Result<(), Status>;
}

/// Control plane: accepts agent connections and proxies API requests
/// through them.
pub struct Server {
    config: ServerConfig,
    agent_listener: TcpListener,
    proxy_listener: TcpListener,
    admin_listener: Option<TcpListener>,
    registry: TunnelRegistry,
    authenticator: Arc<dyn AgentAuthenticator>,
    proxy: Arc<ProxyState>,
}

impl Server {
    pub async fn bind(
        config: ServerConfig,
        authenticator: Arc<dyn AgentAuthenticator>,
        authorizer: Arc<dyn ProxyAuthorizer>,
    ) -> Result<Self> {
        let agent_listener = TcpListener::bind(config.agent_listen)
            .await
            .with_context(|| format!("Failed to bind agent listener on {}", config.agent_listen))?;
        let proxy_listener = TcpListener::bind(config.proxy_listen)
            .await
            .with_context(|| format!("Failed to bind proxy listener on {}", config.proxy_listen))?;
        let admin_listener = match config.admin_listen {
            Some(addr) => Some(
                TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("Failed to bind admin API on {}", addr))?,
            ),
            None => None,
        };

        let registry = TunnelRegistry::new().context("Failed to build tunnel registry")?;
        let proxy = Arc::new(ProxyState {
            registry: registry.clone(),
            authorizer,
            http: HttpToGrpc::new(config.max_chunk_size).context("Failed to build HTTP adapter")?,
            find_timeout: config.find_tunnel_timeout(),
        });

        Ok(Self {
            config,
            agent_listener,
            proxy_listener,
            admin_listener,
            registry,
            authenticator,
            proxy,
        })
    }

    pub fn agent_addr(&self) -> Result<SocketAddr> {
        Ok(self.agent_listener.local_addr()?)
    }

    pub fn proxy_addr(&self) -> Result<SocketAddr> {
        Ok(self.proxy_listener.local_addr()?)
    }

    pub fn admin_addr(&self) -> Result<Option<SocketAddr>> {
        self.admin_listener
            .as_ref()
            .map(|listener| listener.local_addr())
            .transpose()
            .map_err(Into::into)
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    /// Serves until `shutdown` is cancelled, then closes every tunnel.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!("Agent listener on {} ({:?})", self.agent_addr()?, self.config.agent_transport);
        info!("Proxy listening on http://{}", self.proxy_addr()?);

        let agents = AgentAcceptor {
            registry: self.registry.clone(),
            authenticator: self.authenticator,
            config: Arc::new(self.config),
        };
        tokio::spawn(accept_agents(self.agent_listener, agents, shutdown.clone()));
        tokio::spawn(serve_proxy(self.proxy_listener, self.proxy, shutdown.clone()));
        if let Some(listener) = self.admin_listener {
            info!("Admin API listening on http://{}", listener.local_addr()?);
            tokio::spawn(serve_admin(listener, self.registry.clone(), shutdown.clone()));
        }

        shutdown.cancelled().await;
        info!("Shutting down server...");
        self.registry.close_all();
        Ok(())
    }
}

/// Runs the control plane from the config directory until Ctrl+C.
pub async fn run_server(config: Config, config_dir: &Path) -> Result<()> {
    let auth = Arc::new(Auth::new(config_dir)?);
    let authorizer = Arc::new(StaticAuthorizer::new(config.server.proxy_tokens.clone()));
    if config.server.proxy_tokens.is_empty() {
        warn!("No proxy tokens configured; every proxy request will be rejected");
    }

    let server = Server::bind(config.server, auth, authorizer).await?;
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        signal.cancel();
    });
    server.run(shutdown).await
}

#[derive(Clone)]
struct AgentAcceptor {
    registry: TunnelRegistry,
    authenticator: Arc<dyn AgentAuthenticator>,
    config: Arc<ServerConfig>,
}

async fn accept_agents(listener: TcpListener, acceptor: AgentAcceptor, shutdown: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept agent connection: {}", e);
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };
        let acceptor = acceptor.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match acceptor.handle(stream, peer, shutdown).await {
                Ok(()) => debug!("Agent connection from {} finished", peer),
                Err(status) if status.is_cancellation() => {
                    debug!("Agent connection from {} cancelled: {}", peer, status)
                }
                Err(status) => warn!("Agent connection from {} failed: {}", peer, status),
            }
        });
    }
}

impl AgentAcceptor {
    /// Owns one agent connection: handshake, idle watch, then the single call
    /// it serves.
    async fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), Status> {
        let conn = transport::accept(stream, self.config.agent_transport, self.config.max_frame_length).await?;
        let mut reader = conn.reader.decode::<ConnectResponse>();
        let writer = conn.writer.encode::<ConnectRequest>();

        let first = tokio::time::timeout(self.config.handshake_timeout(), reader.recv())
            .await
            .map_err(|_| Status::deadline_exceeded("agent handshake timed out"))??;
        let descriptor = match first {
            Some(ConnectResponse::Descriptor(descriptor)) => descriptor,
            Some(other) => {
                return Err(Status::internal(format!(
                    "expected Descriptor, got field {}",
                    other.field_number()
                )))
            }
            None => return Err(Status::unavailable("agent closed the connection during handshake")),
        };
        if let Err(status) = self.authenticator.authenticate(&descriptor).await {
            warn!("Unauthorized agent {} attempted connection from {}", descriptor.agent_id, peer);
            return Err(status);
        }
        debug!("Accepted tunnel from agent {} at {}", descriptor.agent_id, peer);

        let ctx = shutdown.child_token();
        let _closed = ctx.clone().drop_guard();
        let agent = AgentInfo {
            agent_id: descriptor.agent_id,
            services: descriptor.services,
        };
        let (tunnel, ret) = self
            .registry
            .new_tunnel(agent, TunnelConn { reader, writer }, ctx);
        self.registry.register(tunnel.clone());

        if let IdleOutcome::Closed(reason) = tunnel.watch_idle().await {
            if self.registry.unregister(&tunnel) {
                return reason.map_or(Ok(()), Err);
            }
            // Claimed while the connection went away; the forward reports.
        }
        match ret.await {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(status),
            Err(_) => Err(Status::internal("tunnel was dropped without reporting")),
        }
    }
}

async fn serve_proxy(listener: TcpListener, state: Arc<ProxyState>, shutdown: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept proxy connection: {}", e);
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };
        let state = state.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle_proxy_request(state.clone(), req));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                debug!("Proxy connection from {} ended: {}", peer, e);
            }
        });
    }
}

async fn serve_admin(listener: TcpListener, registry: TunnelRegistry, shutdown: CancellationToken) {
    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!("Failed to accept admin connection: {}", e);
                    continue;
                }
            },
            _ = shutdown.cancelled() => break,
        };
        let registry = registry.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle_admin_request(registry.clone(), req));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                error!("Admin API error: {}", e);
            }
        });
    }
}

async fn handle_admin_request(
    registry: TunnelRegistry,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<AdminBody>> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => Response::builder()
            .status(StatusCode::OK)
            .body(full_body("OK"))?,

        (&Method::GET, "/agents") => {
            let json = serde_json::to_string(&registry.agents())?;
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/json")
                .body(full_body(json))?
        }

        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full_body("Not Found"))?,
    };

    Ok(response)
}
