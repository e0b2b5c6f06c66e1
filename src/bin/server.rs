//! PhazeVPN Server
//!
//! Runs the UDP tunnel server and manages the user database:
//! - `run` serves clients until Ctrl-C
//! - `user ...` creates, updates and removes accounts
//! - `gen-config` prints an example configuration

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use phazevpn::{
    config::{generate_example_config, Config, ServerConfig},
    nat::StunClient,
    server::{Server, ServerCore},
    users::{render_client_config, ClientManager},
    VpnMode,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Default location of the user database
const DEFAULT_USERS_DB: &str = "users.json";

/// PhazeVPN Server - UDP tunnel with selectable privacy modes
#[derive(Parser, Debug)]
#[command(name = "phazevpn-server")]
#[command(about = "PhazeVPN Server - UDP tunnel with selectable privacy modes")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log level (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve clients until interrupted
    Run {
        /// Listen address (overrides config)
        #[arg(short, long)]
        listen: Option<String>,

        /// Echo tunnel packets back to their sender instead of dropping them
        #[arg(long)]
        echo: bool,
    },
    /// Print an example configuration
    GenConfig,
    /// Manage user accounts
    User {
        #[command(subcommand)]
        action: UserAction,
    },
}

#[derive(Subcommand, Debug)]
enum UserAction {
    /// Create an account and print its client configuration
    Create {
        username: String,
        /// Password (generated when omitted)
        #[arg(long)]
        password: Option<String>,
        #[arg(long, default_value = "normal")]
        mode: VpnMode,
        /// Server address written into the client configuration
        #[arg(long)]
        server: Option<String>,
    },
    /// Generate a new password
    ResetPassword { username: String },
    /// Change the privacy mode assigned to an account
    SetMode { username: String, mode: VpnMode },
    /// Enable or disable an account
    SetActive {
        username: String,
        #[arg(action = clap::ArgAction::Set)]
        active: bool,
    },
    /// Show one account
    Info { username: String },
    /// Remove an account
    Delete { username: String },
    /// List all accounts
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::GenConfig = args.command {
        let text = toml::to_string_pretty(&generate_example_config()).context("Failed to render config")?;
        println!("{}", text);
        return Ok(());
    }

    let config = if args.config.exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };
    init_logging(
        args.log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );

    let server_config = config.server.clone().unwrap_or_default();
    match args.command {
        Command::Run { listen, echo } => run(server_config, listen, echo).await,
        Command::User { action } => manage_users(&server_config, action),
        Command::GenConfig => Ok(()),
    }
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }
}

fn users_db(server_config: &ServerConfig) -> PathBuf {
    server_config
        .users_db
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_USERS_DB))
}

async fn run(server_config: ServerConfig, listen: Option<String>, echo: bool) -> Result<()> {
    let settings = server_config.settings().context("Invalid server configuration")?;

    let db = users_db(&server_config);
    let users = if server_config.users_db.is_some() || db.exists() {
        let manager = ClientManager::open(&db).with_context(|| format!("Failed to open {}", db.display()))?;
        info!("Loaded {} user(s) from {}", manager.len(), db.display());
        Some(Arc::new(manager))
    } else {
        None
    };
    if settings.require_auth && users.is_none() {
        return Err(anyhow!("require_auth is set but no user database exists at {}", db.display()));
    }

    let listen_addr = match listen {
        Some(addr) => addr.parse().context("Invalid listen address")?,
        None => server_config.bind_addr()?,
    };
    let socket = UdpSocket::bind(listen_addr)
        .await
        .context("Failed to bind to address")?;

    if server_config.network.enable_nat_traversal {
        let stun = StunClient::new(server_config.network.stun_servers.clone());
        match stun.discover(&socket).await {
            Ok(public) => info!("Public endpoint: {}", public),
            Err(e) => warn!("NAT discovery failed: {}", e),
        }
    }

    let core = Arc::new(ServerCore::new(settings, users));
    let server = Server::new(core.clone(), Arc::new(socket))
        .with_echo(echo)
        .with_sweep_interval(Duration::from_secs(server_config.sweep_interval_secs));

    info!("PhazeVPN Server v{}", phazevpn::VERSION);
    if let Some(addr) = core.server_address() {
        info!("Tunnel network {} (server {})", server_config.vpn_network, addr);
    }

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    let health = core.health();
    info!(
        "Final stats: {}",
        serde_json::to_string(&health).unwrap_or_else(|_| format!("{:?}", health))
    );
    Ok(())
}

fn manage_users(server_config: &ServerConfig, action: UserAction) -> Result<()> {
    let db = users_db(server_config);
    let users = ClientManager::open(&db).with_context(|| format!("Failed to open {}", db.display()))?;

    match action {
        UserAction::Create {
            username,
            password,
            mode,
            server,
        } => {
            let created = users.create_user(&username, password.as_deref(), mode)?;
            let server = server.unwrap_or_else(|| format!("{}:{}", server_config.host, server_config.port));
            println!("Created user {} ({})", created.username, created.mode.display_name());
            println!("Password: {}", created.password);
            println!();
            println!("{}", render_client_config(&created, &server)?);
        }
        UserAction::ResetPassword { username } => {
            let password = users.reset_password(&username)?;
            println!("New password for {}: {}", username, password);
        }
        UserAction::SetMode { username, mode } => {
            users.set_mode(&username, mode)?;
            println!("{} now uses {}", username, mode.display_name());
        }
        UserAction::SetActive { username, active } => {
            users.set_active(&username, active)?;
            println!("{} is now {}", username, if active { "active" } else { "disabled" });
        }
        UserAction::Info { username } => {
            let info = users
                .get_user_info(&username)
                .ok_or_else(|| anyhow!("No such user: {}", username))?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        UserAction::Delete { username } => {
            if users.delete_user(&username)? {
                println!("Deleted {}", username);
            } else {
                println!("No such user: {}", username);
            }
        }
        UserAction::List => {
            let all = users.list_users();
            if all.is_empty() {
                println!("No users");
            }
            for user in all {
                println!(
                    "{:<24} {:<12} {:<8} connections={}",
                    user.username,
                    user.mode.name(),
                    if user.active { "active" } else { "disabled" },
                    user.total_connections
                );
            }
        }
    }
    Ok(())
}
