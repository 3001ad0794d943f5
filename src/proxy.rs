//! Front end for API clients: `/agents/{agent_id}/{path}` is proxied to
//! `{path}` on that agent's upstream service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use tracing::{debug, warn};

use crate::config::ProxyTokenConfig;
use crate::error::{Code, Status};
use crate::http::{full_body, ProxyBody};
use crate::http2grpc::HttpToGrpc;
use crate::proto::{Impersonation, TypedValue, HTTP_METHOD};
use crate::rpc::{duplex, Metadata};
use crate::tunnel::TunnelRegistry;

/// Frames buffered on each direction of a proxied call.
const CALL_BUFFER: usize = 16;

/// Seconds a client is told to wait before retrying an unavailable agent.
const RETRY_AFTER_SECS: &str = "1";

/// Decides whether a proxy request may reach an agent.
#[async_trait]
pub trait ProxyAuthorizer: Send + Sync {
    /// `token` is the bearer token of the request, if any. The returned value
    /// travels with the request as its extension.
    async fn authorize(&self, token: Option<&str>, agent_id: &str) -> Result<Option<TypedValue>, Status>;
}

/// Accepts the bearer tokens listed in the config.
pub struct StaticAuthorizer {
    tokens: HashMap<String, ProxyTokenConfig>,
}

impl StaticAuthorizer {
    pub fn new(tokens: HashMap<String, ProxyTokenConfig>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl ProxyAuthorizer for StaticAuthorizer {
    async fn authorize(&self, token: Option<&str>, agent_id: &str) -> Result<Option<TypedValue>, Status> {
        let token = token.ok_or_else(|| Status::unauthenticated("missing bearer token"))?;
        let grant = self
            .tokens
            .get(token)
            .ok_or_else(|| Status::unauthenticated("unknown bearer token"))?;
        if !grant.agents.iter().any(|a| a == "*" || a == agent_id) {
            return Err(Status::permission_denied(format!(
                "token may not reach agent {agent_id}"
            )));
        }
        grant
            .impersonate
            .as_ref()
            .map(Impersonation::to_typed_value)
            .transpose()
    }
}

pub struct ProxyState {
    pub registry: TunnelRegistry,
    pub authorizer: Arc<dyn ProxyAuthorizer>,
    pub http: HttpToGrpc,
    pub find_timeout: Duration,
}

/// Splits `/agents/{agent_id}/{rest}` into the agent id and `/{rest}`.
pub fn route(path: &str) -> Option<(&str, String)> {
    let rest = path.strip_prefix("/agents/")?;
    let (agent_id, tail) = match rest.split_once('/') {
        Some((agent_id, tail)) => (agent_id, format!("/{tail}")),
        None => (rest, "/".to_string()),
    };
    (!agent_id.is_empty()).then_some((agent_id, tail))
}

fn bearer_token(req: &Request<Incoming>) -> Option<&str> {
    let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}

/// HTTP status for a call that failed before anything was written.
pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn error_response(status: &Status) -> Response<ProxyBody> {
    let code = http_status(status.code());
    let mut response = Response::new(full_body(format!("{}\n", status.message())));
    *response.status_mut() = code;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    if code == StatusCode::SERVICE_UNAVAILABLE {
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
    }
    response
}

pub async fn handle_proxy_request(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, std::convert::Infallible> {
    let result = proxy(&state, req).await;
    Ok(result.unwrap_or_else(|status| {
        debug!(error = %status, "Proxy request failed");
        error_response(&status)
    }))
}

async fn proxy(state: &ProxyState, mut req: Request<Incoming>) -> Result<Response<ProxyBody>, Status> {
    let path = req.uri().path().to_string();
    let (agent_id, url_path) =
        route(&path).ok_or_else(|| Status::not_found(format!("no route for {path}")))?;

    let extra = match state.authorizer.authorize(bearer_token(&req), agent_id).await {
        Ok(extra) => extra,
        Err(status) => {
            warn!(agent = %agent_id, error = %status, "Rejected proxy request");
            return Err(status);
        }
    };
    req.headers_mut().remove(AUTHORIZATION);

    let tunnel = state.registry.find_tunnel(agent_id, state.find_timeout).await?;
    debug!(agent = %agent_id, tunnel = tunnel.id(), path = %url_path, "Proxying request");

    let (client, incoming, sender) = duplex(HTTP_METHOD, Metadata::new(), CALL_BUFFER);
    tokio::spawn(async move {
        let result = tunnel.forward_stream(incoming, Arc::new(sender.clone())).await;
        if let Err(status) = &result {
            debug!(tunnel = tunnel.id(), error = %status, "Forwarding failed");
        }
        sender.finish(result).await;
    });

    state
        .http
        .forward(
            req,
            url_path,
            extra,
            client.requests.encode(),
            client.responses.decode(),
            client.guard,
        )
        .await
}
