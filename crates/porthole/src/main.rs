use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use porthole::auth::{self, ApiClient, AuthError};
use porthole::config::AgentConfig;
use porthole::connector::{derive_ws_url, TunnelConnection};

const DEFAULT_SERVER_URL: &str = "https://porthole.dev";

/// Porthole - expose workspace ports through a public subdomain
#[derive(Parser, Debug)]
#[command(name = "porthole")]
#[command(about = "Expose local ports to the public internet through a reverse tunnel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in to the token service via device code
    Login {
        #[arg(long, default_value = DEFAULT_SERVER_URL)]
        server_url: String,
    },

    /// Delete the stored login
    Logout,

    /// Open a tunnel for a workspace
    Connect {
        /// Workspace this tunnel belongs to
        #[arg(long)]
        workspace_id: String,

        /// Primary local port to expose
        #[arg(long)]
        port: u16,

        /// Tunnel WebSocket endpoint (defaults to the server URL's /tunnel)
        #[arg(long)]
        ws_url: Option<String>,

        /// Token service URL (defaults to the stored login's server)
        #[arg(long)]
        server_url: Option<String>,

        /// Pre-minted tunnel token; skips the token-service calls
        #[arg(long)]
        token: Option<String>,

        /// Additional named service, e.g. --expose api=4000 (repeatable)
        #[arg(long = "expose", value_name = "NAME=PORT")]
        expose: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("porthole=info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Login { server_url } => run_login(&server_url).await,
        Commands::Logout => run_logout(),
        Commands::Connect {
            workspace_id,
            port,
            ws_url,
            server_url,
            token,
            expose,
        } => run_connect(workspace_id, port, ws_url, server_url, token, expose).await,
    };

    if let Err(e) = result {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run_login(server_url: &str) -> Result<()> {
    let config = auth::login(server_url).await?;
    println!("Logged in to {}", config.server_url);
    Ok(())
}

fn run_logout() -> Result<()> {
    AgentConfig::delete_default()?;
    println!("Logged out");
    Ok(())
}

async fn run_connect(
    workspace_id: String,
    port: u16,
    ws_url: Option<String>,
    server_url: Option<String>,
    token: Option<String>,
    expose: Vec<String>,
) -> Result<()> {
    if port == 0 {
        anyhow::bail!("Invalid primary port: 0");
    }
    let exposed_ports = parse_expose(&expose)?;

    let server_url = server_url
        .or_else(|| AgentConfig::try_load_default().map(|c| c.server_url))
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

    // A pre-minted token bypasses the token service entirely.
    let (tunnel_token, granted_connect) = match token {
        Some(token) => (token, None),
        None => {
            let grant = mint_and_register(&workspace_id, port, &exposed_ports, &server_url).await?;
            (grant.token, grant.connect)
        }
    };

    let ws_url = ws_url
        .or(granted_connect)
        .unwrap_or_else(|| derive_ws_url(&server_url));

    let shutdown = CancellationToken::new();
    let signal_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    let connection = TunnelConnection::new(ws_url, tunnel_token, port, exposed_ports);
    let result = connection.run(shutdown).await;
    signal_task.abort();
    result
}

/// Mint the tunnel token and push the port allowlist, each with at most one
/// automatic re-login on an expired agent token.
async fn mint_and_register(
    workspace_id: &str,
    port: u16,
    exposed_ports: &BTreeMap<String, u16>,
    server_url: &str,
) -> Result<auth::TunnelGrant> {
    let config = AgentConfig::try_load_default()
        .context("Not logged in. Run 'porthole login' first, or pass --token.")?;
    let server_url = server_url.to_string();
    let api = ApiClient::new(server_url.clone());

    let mut agent_token = config.agent_token;

    let grant = auth::with_auth_retry(
        &mut agent_token,
        |tok| {
            let api = api.clone();
            let workspace_id = workspace_id.to_string();
            async move { api.mint_tunnel_token(&tok, &workspace_id).await }
        },
        || relogin(server_url.clone()),
    )
    .await
    .context("Failed to mint tunnel token")?;

    auth::with_auth_retry(
        &mut agent_token,
        |tok| {
            let api = api.clone();
            let workspace_id = workspace_id.to_string();
            let exposed_ports = exposed_ports.clone();
            async move {
                api.register_ports(&tok, &workspace_id, port, &exposed_ports)
                    .await
            }
        },
        || relogin(server_url.clone()),
    )
    .await
    .context("Failed to register workspace ports")?;

    if let Some(subdomain) = &grant.subdomain {
        tracing::info!("Assigned subdomain: {}", subdomain);
    }
    Ok(grant)
}

async fn relogin(server_url: String) -> Result<String, AuthError> {
    tracing::warn!("Agent token rejected; starting re-login");
    match auth::login(&server_url).await {
        Ok(config) => Ok(config.agent_token),
        Err(e) => Err(AuthError::Relogin(format!("{e:#}"))),
    }
}

/// Parse repeated `--expose name=port` flags into a service map.
fn parse_expose(entries: &[String]) -> Result<BTreeMap<String, u16>> {
    let mut exposed = BTreeMap::new();
    for entry in entries {
        let (name, port) = entry
            .split_once('=')
            .with_context(|| format!("Invalid --expose '{entry}': expected NAME=PORT"))?;
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            anyhow::bail!("Invalid service name '{name}': use letters, digits, and dashes");
        }
        let port: u16 = port
            .parse()
            .with_context(|| format!("Invalid port in --expose '{entry}'"))?;
        if port == 0 {
            anyhow::bail!("Invalid port in --expose '{entry}': 0");
        }
        exposed.insert(name.to_string(), port);
    }
    Ok(exposed)
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
