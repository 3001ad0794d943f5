//! End-to-end: a real server, a real agent and a real upstream on ephemeral
//! ports, driven by reqwest and raw sockets.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backhaul::agent::Agent;
use backhaul::config::{AgentConfig, Auth, ProxyTokenConfig, ServerConfig};
use backhaul::error::{ErrReporter, LogReporter};
use backhaul::proxy::StaticAuthorizer;
use backhaul::server::Server;
use backhaul::transport::TransportKind;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const AGENT_ID: &str = "edge-1";
const AGENT_TOKEN: &str = "agent-secret";
const CLIENT_TOKEN: &str = "client-token";

#[derive(Default)]
struct CountingReporter(AtomicUsize);

impl ErrReporter for CountingReporter {
    fn handle_processing_error(&self, _msg: &str, _err: &(dyn std::error::Error + 'static)) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Echoes the request as JSON and its `x-` headers as response headers;
/// `/upgrade` switches to a PING/PONG protocol.
async fn upstream_handler(mut req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() == "/upgrade" {
        let on_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            if let Ok(upgraded) = on_upgrade.await {
                let mut io = TokioIo::new(upgraded);
                let mut buf = [0u8; 4];
                while io.read_exact(&mut buf).await.is_ok() {
                    if &buf == b"PING" && io.write_all(b"PONG").await.is_err() {
                        break;
                    }
                }
            }
        });
        let response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, "upgrade")
            .header(UPGRADE, "ping")
            .body(Full::default())
            .unwrap();
        return Ok(response);
    }

    let header = |name: HeaderName| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let echoed: Vec<(HeaderName, HeaderValue)> = req
        .headers()
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-"))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    let mut headers = serde_json::Map::new();
    for (name, value) in &echoed {
        let values = headers
            .entry(name.as_str())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(values) = values {
            values.push(Value::String(value.to_str().unwrap_or_default().to_string()));
        }
    }
    let mut seen = json!({
        "method": req.method().as_str(),
        "uri": req.uri().to_string(),
        "authorization": header(AUTHORIZATION),
        "content_length": header(CONTENT_LENGTH),
        "headers": headers,
    });
    let body = req.into_body().collect().await.unwrap().to_bytes();
    seen["body"] = Value::String(String::from_utf8_lossy(&body).into_owned());
    let mut response = Response::new(Full::new(Bytes::from(seen.to_string())));
    for (name, value) in echoed {
        response.headers_mut().append(name, value);
    }
    Ok(response)
}

async fn start_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(upstream_handler))
                    .with_upgrades()
                    .await;
            });
        }
    });
    addr
}

/// An address nothing listens on.
async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

struct Harness {
    proxy: SocketAddr,
    admin: SocketAddr,
    shutdown: CancellationToken,
    _dir: TempDir,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Setup {
    upstream: SocketAddr,
    transport: TransportKind,
    agent_token: &'static str,
    reporter: Arc<dyn ErrReporter>,
}

impl Setup {
    fn new(upstream: SocketAddr) -> Self {
        Self {
            upstream,
            transport: TransportKind::Tcp,
            agent_token: AGENT_TOKEN,
            reporter: Arc::new(LogReporter),
        }
    }

    async fn start(self) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let auth = Arc::new(Auth::new(dir.path()).unwrap());
        auth.authorize(AGENT_ID, AGENT_TOKEN).unwrap();

        let mut tokens = HashMap::new();
        tokens.insert(
            CLIENT_TOKEN.to_string(),
            ProxyTokenConfig {
                agents: vec![AGENT_ID.to_string()],
                impersonate: None,
            },
        );
        let local = "127.0.0.1:0".parse().unwrap();
        let config = ServerConfig {
            agent_listen: local,
            agent_transport: self.transport,
            proxy_listen: local,
            admin_listen: Some(local),
            find_tunnel_timeout_ms: 2000,
            proxy_tokens: tokens.clone(),
            ..ServerConfig::default()
        };
        let server = Server::bind(config, auth, Arc::new(StaticAuthorizer::new(tokens)))
            .await
            .unwrap();
        let agent_addr = server.agent_addr().unwrap();
        let proxy = server.proxy_addr().unwrap();
        let admin = server.admin_addr().unwrap().unwrap();

        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));

        let scheme = match self.transport {
            TransportKind::Tcp => "tcp",
            TransportKind::Websocket => "ws",
        };
        let agent_config = AgentConfig {
            server_url: format!("{scheme}://{agent_addr}/"),
            agent_id: Some(AGENT_ID.to_string()),
            token: Some(self.agent_token.to_string()),
            upstream_url: format!("http://{}", self.upstream),
            backoff_initial_ms: 50,
            backoff_max_ms: 200,
            ..AgentConfig::default()
        };
        let agent = Agent::new(&agent_config, self.reporter).unwrap();
        tokio::spawn(agent.run(shutdown.clone()));

        Harness {
            proxy,
            admin,
            shutdown,
            _dir: dir,
        }
    }
}

impl Harness {
    fn url(&self, path: &str) -> String {
        format!("http://{}/agents/{AGENT_ID}{path}", self.proxy)
    }
}

#[tokio::test]
async fn proxies_request_and_response() {
    let harness = Setup::new(start_upstream().await).start().await;

    let response = reqwest::Client::new()
        .post(harness.url("/api/v1/pods?watch=1"))
        .bearer_auth(CLIENT_TOKEN)
        .header("x-multi", "a")
        .header("x-multi", "b")
        .header("x-single", "c")
        .body("hello world")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    // Repeated header values come back in order, both ways.
    let multi: Vec<_> = response.headers().get_all("x-multi").iter().collect();
    assert_eq!(multi, ["a", "b"]);
    assert_eq!(response.headers()["x-single"], "c");

    let seen: Value = response.json().await.unwrap();
    assert_eq!(seen["method"], "POST");
    assert_eq!(seen["uri"], "/api/v1/pods?watch=1");
    assert_eq!(
        seen["headers"],
        json!({ "x-multi": ["a", "b"], "x-single": ["c"] })
    );
    assert_eq!(seen["body"], "hello world");
    // The client's credentials stop at the proxy.
    assert_eq!(seen["authorization"], Value::Null);
}

#[tokio::test]
async fn serves_sequential_requests_on_fresh_tunnels() {
    let harness = Setup::new(start_upstream().await).start().await;
    let client = reqwest::Client::new();

    for i in 0..5 {
        let response = client
            .get(harness.url(&format!("/items/{i}")))
            .bearer_auth(CLIENT_TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let seen: Value = response.json().await.unwrap();
        assert_eq!(seen["uri"], format!("/items/{i}"));
    }
}

#[tokio::test]
async fn empty_body_keeps_zero_content_length() {
    let harness = Setup::new(start_upstream().await).start().await;

    let response = reqwest::Client::new()
        .put(harness.url("/empty"))
        .bearer_auth(CLIENT_TOKEN)
        .header(CONTENT_LENGTH, "0")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let seen: Value = response.json().await.unwrap();
    assert_eq!(seen["content_length"], "0");
    assert_eq!(seen["body"], "");
}

#[tokio::test]
async fn websocket_transport_carries_the_same_calls() {
    let harness = Setup {
        transport: TransportKind::Websocket,
        ..Setup::new(start_upstream().await)
    }
    .start()
    .await;

    let response = reqwest::Client::new()
        .post(harness.url("/over/ws"))
        .bearer_auth(CLIENT_TOKEN)
        .body("framed")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let seen: Value = response.json().await.unwrap();
    assert_eq!(seen["body"], "framed");
}

#[tokio::test]
async fn upgraded_connection_exchanges_raw_bytes() {
    let harness = Setup::new(start_upstream().await).start().await;

    let mut stream = TcpStream::connect(harness.proxy).await.unwrap();
    let request = format!(
        "GET /agents/{AGENT_ID}/upgrade HTTP/1.1\r\n\
         Host: proxy\r\n\
         Authorization: Bearer {CLIENT_TOKEN}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: ping\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "{head}");
    assert!(head.to_ascii_lowercase().contains("upgrade: ping"), "{head}");

    for _ in 0..2 {
        stream.write_all(b"PING").await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"PONG");
    }

    stream.shutdown().await.unwrap();
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("upgraded connection did not close")
        .unwrap();
    assert_eq!(read, 0);
}

#[tokio::test]
async fn refused_upstream_is_unavailable_and_reported_once() {
    let reporter = Arc::new(CountingReporter::default());
    let harness = Setup {
        reporter: reporter.clone(),
        ..Setup::new(closed_port().await)
    }
    .start()
    .await;

    let response = reqwest::Client::new()
        .get(harness.url("/anything"))
        .bearer_auth(CLIENT_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    assert_eq!(response.headers()["retry-after"], "1");
    assert_eq!(reporter.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn proxy_requires_a_token_for_the_agent() {
    let harness = Setup::new(start_upstream().await).start().await;
    let client = reqwest::Client::new();

    let response = client.get(harness.url("/x")).send().await.unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .get(harness.url("/x"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = client
        .get(format!("http://{}/agents/edge-2/x", harness.proxy))
        .bearer_auth(CLIENT_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    let response = client
        .get(format!("http://{}/elsewhere", harness.proxy))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn unauthorized_agent_never_gets_traffic() {
    let harness = Setup {
        agent_token: "not-the-token",
        ..Setup::new(start_upstream().await)
    }
    .start()
    .await;

    let response = reqwest::Client::new()
        .get(harness.url("/x"))
        .bearer_auth(CLIENT_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn admin_api_lists_connected_agents() {
    let harness = Setup::new(start_upstream().await).start().await;
    let client = reqwest::Client::new();

    let health = client
        .get(format!("http://{}/health", harness.admin))
        .send()
        .await
        .unwrap();
    assert_eq!(health.text().await.unwrap(), "OK");

    let mut agents = Value::Null;
    for _ in 0..50 {
        agents = client
            .get(format!("http://{}/agents", harness.admin))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if agents[0]["idle_tunnels"].as_u64().unwrap_or(0) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(agents[0]["agent_id"], AGENT_ID);
    assert!(agents[0]["idle_tunnels"].as_u64().unwrap() > 0);
    assert_eq!(
        agents[0]["services"],
        json!(["/backhaul.http.Http/MakeRequest"])
    );
}
