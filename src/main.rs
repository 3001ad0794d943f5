use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use directories::{BaseDirs, ProjectDirs};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use backhaul::agent::run_agent;
use backhaul::config::{generate_token, validate_agent_id, Auth, Config, ProxyTokenConfig};
use backhaul::server::run_server;

#[derive(Parser, Debug)]
#[command(
    name = "backhaul",
    version = env!("CARGO_PKG_VERSION"),
    about = "Reverse HTTP tunnel into private clusters",
    long_about = "backhaul lets a control plane reach HTTP services inside NAT-ed clusters through connections the clusters open themselves"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration directory path
    #[arg(short, long, env = "BACKHAUL_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "BACKHAUL_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the configuration and an agent token
    Init {
        /// Force overwrite the existing agent token
        #[arg(short, long)]
        force: bool,

        /// Id this agent announces to the control plane
        #[arg(long)]
        agent_id: Option<String>,
    },

    /// Start the control plane
    Server {
        /// Bind address for the admin API
        #[arg(short, long)]
        admin_bind: Option<SocketAddr>,
    },

    /// Start the in-cluster agent
    Agent {
        /// Control plane address (tcp://host:port or ws://host:port)
        #[arg(short, long, env = "BACKHAUL_SERVER_URL")]
        server_url: Option<String>,

        /// Base URL of the service requests are forwarded to
        #[arg(short, long, env = "BACKHAUL_UPSTREAM_URL")]
        upstream_url: Option<String>,
    },

    /// Show configuration information
    Info,

    /// Authorize an agent to connect
    Authorize {
        /// Agent id to authorize
        agent_id: String,

        /// Token the agent presents
        token: String,
    },

    /// Revoke agent authorization
    Revoke {
        /// Agent id to revoke
        agent_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(cli.log_level.parse()?)
                .from_env_lossy(),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let config_path = config_dir(cli.config.as_deref())?;
    std::fs::create_dir_all(&config_path)
        .with_context(|| format!("Failed to create config directory: {:?}", config_path))?;

    let mut config = Config::load(&config_path)?;

    match cli.command {
        Commands::Init { force, agent_id } => {
            if config.agent.token.is_some() && !force {
                warn!("Agent token already exists. Use --force to overwrite.");
                return Ok(());
            }

            if let Some(agent_id) = agent_id {
                validate_agent_id(&agent_id)?;
                config.agent.agent_id = Some(agent_id);
            }
            let agent_id = config
                .agent
                .agent_id
                .get_or_insert_with(|| "default".to_string())
                .clone();
            let token = generate_token();
            config.agent.token = Some(token.clone());

            if config.server.proxy_tokens.is_empty() {
                config.server.proxy_tokens.insert(
                    generate_token(),
                    ProxyTokenConfig {
                        agents: vec!["*".to_string()],
                        impersonate: None,
                    },
                );
            }
            config.save(&config_path)?;

            info!("✓ backhaul initialized successfully");
            info!("Agent id: {}", agent_id);
            info!("Config directory: {:?}", config_path);
            info!("Authorize it on the control plane with:");
            info!("  backhaul authorize {} {}", agent_id, token);
        }

        Commands::Server { admin_bind } => {
            if let Some(addr) = admin_bind {
                config.server.admin_listen = Some(addr);
            }
            info!("Starting backhaul server");
            run_server(config, &config_path).await?;
        }

        Commands::Agent {
            server_url,
            upstream_url,
        } => {
            if let Some(url) = server_url {
                config.agent.server_url = url;
            }
            if let Some(url) = upstream_url {
                config.agent.upstream_url = url;
            }
            info!("Starting backhaul agent");
            info!("Upstream: {}", config.agent.upstream_url);
            run_agent(&config.agent).await?;
        }

        Commands::Info => {
            info!("backhaul configuration");
            info!("======================");
            info!("Config directory: {:?}", config_path);

            match &config.agent.agent_id {
                Some(agent_id) => {
                    info!("Agent id: {}", agent_id);
                    info!("Control plane: {}", config.agent.server_url);
                    info!("Upstream: {}", config.agent.upstream_url);
                    if config.agent.token.is_none() {
                        warn!("No agent token. Run 'backhaul init' first");
                    }
                }
                None => warn!("No agent configured. Run 'backhaul init' first"),
            }

            info!("Agent listener: {}", config.server.agent_listen);
            info!("Proxy listener: {}", config.server.proxy_listen);
            info!("Proxy tokens: {}", config.server.proxy_tokens.len());

            let agents = Auth::new(&config_path)?.list()?;
            if !agents.is_empty() {
                info!("\nAuthorized agents:");
                for agent_id in &agents {
                    info!("  {}", agent_id);
                }
            }
        }

        Commands::Authorize { agent_id, token } => {
            Auth::new(&config_path)?.authorize(&agent_id, &token)?;
            info!("✓ Authorized agent: {}", agent_id);
        }

        Commands::Revoke { agent_id } => {
            if Auth::new(&config_path)?.revoke(&agent_id)? {
                info!("✓ Revoked authorization for agent: {}", agent_id);
            } else {
                warn!("Agent {} was not authorized", agent_id);
            }
        }
    }

    Ok(())
}

/// Explicit path with `~` expanded, or the platform config directory.
fn config_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(expand_tilde(path)),
        None => ProjectDirs::from("", "", "backhaul")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .context("Could not determine a home directory; pass --config"),
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), BaseDirs::new()) {
        (Ok(rest), Some(dirs)) => dirs.home_dir().join(rest),
        _ => path.to_path_buf(),
    }
}
