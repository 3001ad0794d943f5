use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use subtle::ConstantTimeEq;

use crate::error::{Code, Status};
use crate::http::DEFAULT_MAX_CHUNK_SIZE;
use crate::proto::{AgentDescriptor, Impersonation};
use crate::server::AgentAuthenticator;
use crate::transport::{TransportKind, DEFAULT_MAX_FRAME_LENGTH};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Where agents connect.
    pub agent_listen: SocketAddr,
    pub agent_transport: TransportKind,
    /// Where API clients send proxied requests.
    pub proxy_listen: SocketAddr,
    pub admin_listen: Option<SocketAddr>,
    pub handshake_timeout_ms: u64,
    /// How long a proxied request waits for an idle tunnel.
    pub find_tunnel_timeout_ms: u64,
    pub max_frame_length: usize,
    pub max_chunk_size: usize,
    /// Bearer tokens accepted by the proxy.
    pub proxy_tokens: HashMap<String, ProxyTokenConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyTokenConfig {
    /// Agent ids this token may reach; `*` matches any.
    #[serde(default)]
    pub agents: Vec<String>,
    /// Identity the upstream call is made as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impersonate: Option<Impersonation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// `tcp://host:port` or `ws://host:port/path`.
    pub server_url: String,
    pub agent_id: Option<String>,
    pub token: Option<String>,
    /// Base URL of the in-cluster service requests are made against.
    pub upstream_url: String,
    /// File holding a bearer token for the upstream service.
    pub upstream_token_file: Option<PathBuf>,
    pub min_idle_connections: usize,
    pub max_connections: usize,
    pub max_chunk_size: usize,
    pub max_frame_length: usize,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            agent_listen: SocketAddr::from(([0, 0, 0, 0], 8150)),
            agent_transport: TransportKind::Tcp,
            proxy_listen: SocketAddr::from(([127, 0, 0, 1], 8151)),
            admin_listen: Some(SocketAddr::from(([127, 0, 0, 1], 2019))),
            handshake_timeout_ms: 10_000,
            find_tunnel_timeout_ms: 5_000,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            proxy_tokens: HashMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn find_tunnel_timeout(&self) -> Duration {
        Duration::from_millis(self.find_tunnel_timeout_ms)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "tcp://127.0.0.1:8150".to_string(),
            agent_id: None,
            token: None,
            upstream_url: "http://127.0.0.1:8080".to_string(),
            upstream_token_file: None,
            min_idle_connections: 2,
            max_connections: 16,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl AgentConfig {
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Reads the upstream bearer token, if one is configured.
    pub fn upstream_token(&self) -> Result<Option<String>> {
        match &self.upstream_token_file {
            Some(path) => {
                let token = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read upstream token file: {:?}", path))?;
                Ok(Some(token.trim().to_string()))
            }
            None => Ok(None),
        }
    }
}

impl Config {
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_file = config_dir.join("config.toml");

        if config_file.exists() {
            let contents = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            toml::from_str(&contents).with_context(|| "Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, config_dir: &Path) -> Result<()> {
        let config_file = config_dir.join("config.toml");
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_file, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_file))?;
        Ok(())
    }
}

/// Random URL-safe secret for agents and proxy clients.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Agent ids double as file names.
pub fn validate_agent_id(agent_id: &str) -> Result<(), Status> {
    let valid = !agent_id.is_empty()
        && agent_id.len() <= 128
        && agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !agent_id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(Status::new(
            Code::InvalidArgument,
            format!("invalid agent id {agent_id:?}"),
        ))
    }
}

/// Authorized agents, one file per agent id holding its token.
pub struct Auth {
    auth_dir: PathBuf,
}

impl Auth {
    pub fn new(config_dir: &Path) -> Result<Self> {
        let auth_dir = config_dir.join("auth");
        std::fs::create_dir_all(&auth_dir)
            .with_context(|| format!("Failed to create auth directory: {:?}", auth_dir))?;
        Ok(Self { auth_dir })
    }

    pub fn is_authorized(&self, agent_id: &str) -> bool {
        validate_agent_id(agent_id).is_ok() && self.auth_dir.join(agent_id).exists()
    }

    pub fn authorize(&self, agent_id: &str, token: &str) -> Result<()> {
        validate_agent_id(agent_id)?;
        std::fs::write(self.auth_dir.join(agent_id), token)?;
        Ok(())
    }

    /// Returns whether the agent was authorized before.
    pub fn revoke(&self, agent_id: &str) -> Result<bool> {
        validate_agent_id(agent_id)?;
        let path = self.auth_dir.join(agent_id);
        if path.exists() {
            std::fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let mut agents = Vec::new();
        for entry in std::fs::read_dir(&self.auth_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                agents.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        agents.sort();
        Ok(agents)
    }
}

/// Constant time in the token contents; only the lengths may leak.
fn tokens_match(expected: &str, presented: &str) -> subtle::Choice {
    expected.as_bytes().ct_eq(presented.as_bytes())
}

#[async_trait]
impl AgentAuthenticator for Auth {
    async fn authenticate(&self, descriptor: &AgentDescriptor) -> Result<(), Status> {
        validate_agent_id(&descriptor.agent_id)
            .map_err(|status| Status::unauthenticated(status.message))?;
        let path = self.auth_dir.join(&descriptor.agent_id);
        let expected = match tokio::fs::read_to_string(&path).await {
            Ok(token) => token,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Status::unauthenticated(format!(
                    "agent {} is not authorized",
                    descriptor.agent_id
                )))
            }
            Err(e) => return Err(Status::from_io("read agent token", &e)),
        };
        if bool::from(tokens_match(expected.trim(), &descriptor.token)) {
            Ok(())
        } else {
            Err(Status::unauthenticated(format!(
                "invalid token for agent {}",
                descriptor.agent_id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(agent_id: &str, token: &str) -> AgentDescriptor {
        AgentDescriptor {
            agent_id: agent_id.to_string(),
            token: token.to_string(),
            services: Vec::new(),
        }
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.server.max_chunk_size, DEFAULT_MAX_CHUNK_SIZE);
        assert_eq!(config.agent.min_idle_connections, 2);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            r#"
[server]
agent_transport = "websocket"
find_tunnel_timeout_ms = 250

[server.proxy_tokens.ci]
agents = ["*"]

[server.proxy_tokens.ci.impersonate]
user = "ci-bot"
groups = ["deployers"]

[agent]
agent_id = "edge-1"
"#,
        )
        .unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.server.agent_transport, TransportKind::Websocket);
        assert_eq!(config.server.find_tunnel_timeout(), Duration::from_millis(250));
        assert_eq!(config.server.handshake_timeout_ms, 10_000);
        let ci = &config.server.proxy_tokens["ci"];
        assert_eq!(ci.agents, ["*"]);
        assert_eq!(
            ci.impersonate.as_ref().and_then(|who| who.user.as_deref()),
            Some("ci-bot")
        );
        assert_eq!(config.agent.agent_id.as_deref(), Some("edge-1"));
        assert_eq!(config.agent.max_connections, 16);
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.agent.token = Some(generate_token());
        config.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.agent.token, config.agent.token);
    }

    #[test]
    fn tokens_are_distinct_and_url_safe() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn agent_ids_cannot_escape_the_auth_dir() {
        assert!(validate_agent_id("edge-1.eu_west").is_ok());
        assert!(validate_agent_id("../etc/passwd").is_err());
        assert!(validate_agent_id(".hidden").is_err());
        assert!(validate_agent_id("").is_err());
    }

    #[test]
    fn tokens_match_only_on_identical_bytes() {
        assert!(bool::from(tokens_match("s3cret", "s3cret")));
        assert!(!bool::from(tokens_match("s3cret", "s3creT")));
        assert!(!bool::from(tokens_match("s3cret", "s3cre")));
        assert!(!bool::from(tokens_match("s3cret", "")));
    }

    #[tokio::test]
    async fn authenticate_checks_the_stored_token() {
        let dir = tempfile::tempdir().unwrap();
        let auth = Auth::new(dir.path()).unwrap();
        auth.authorize("edge-1", "s3cret").unwrap();
        assert!(auth.is_authorized("edge-1"));
        assert_eq!(auth.list().unwrap(), ["edge-1"]);

        auth.authenticate(&descriptor("edge-1", "s3cret")).await.unwrap();
        let wrong = auth
            .authenticate(&descriptor("edge-1", "guess"))
            .await
            .unwrap_err();
        assert_eq!(wrong.code(), Code::Unauthenticated);
        let unknown = auth
            .authenticate(&descriptor("edge-2", "s3cret"))
            .await
            .unwrap_err();
        assert_eq!(unknown.code(), Code::Unauthenticated);

        assert!(auth.revoke("edge-1").unwrap());
        assert!(!auth.revoke("edge-1").unwrap());
        assert!(auth.authenticate(&descriptor("edge-1", "s3cret")).await.is_err());
    }
}
