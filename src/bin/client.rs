//! PhazeVPN Client
//!
//! Connects to a PhazeVPN server and exchanges tunnel payloads:
//! - each line read from stdin is sent as one DATA packet
//! - received DATA payloads are printed to stdout
//! - keepalives are sent while idle, rekeys are answered automatically

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use phazevpn::{
    client::{connect, ClientEvent, ClientOptions, ClientSession},
    config::{ClientConfig, Config},
    transport::RECV_BUFFER_SIZE,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Handshake attempts before giving up
const HANDSHAKE_ATTEMPTS: u32 = 3;

/// PhazeVPN Client - UDP tunnel with selectable privacy modes
#[derive(Parser, Debug)]
#[command(name = "phazevpn-client")]
#[command(about = "PhazeVPN Client - UDP tunnel with selectable privacy modes")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "client.toml")]
    config: PathBuf,

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Privacy mode: normal, semi_ghost, full_ghost (overrides config)
    #[arg(short, long)]
    mode: Option<String>,

    /// Username (overrides config)
    #[arg(short, long)]
    username: Option<String>,

    /// Password (overrides config)
    #[arg(short, long)]
    password: Option<String>,

    /// Log level (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if args.config.exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_deref().unwrap_or(&config.logging.level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut client_config = config.client.unwrap_or_default();
    if let Some(server) = args.server {
        client_config.server = server;
    }
    if let Some(mode) = args.mode {
        client_config.mode = mode;
    }
    if args.username.is_some() {
        client_config.username = args.username;
    }
    if args.password.is_some() {
        client_config.password = args.password;
    }
    client_config.validate()?;
    if client_config.vpn_mode().is_none() {
        warn!("Unknown mode {:?}, the server decides", client_config.mode);
    }

    run(client_config).await
}

async fn run(config: ClientConfig) -> Result<()> {
    let server: SocketAddr = lookup_host(&config.server)
        .await
        .with_context(|| format!("Failed to resolve {}", config.server))?
        .next()
        .ok_or_else(|| anyhow!("No address for {}", config.server))?;
    let bind: SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };
    let socket = UdpSocket::bind(bind).await.context("Failed to bind socket")?;

    let mut options = ClientOptions::new(config.mode.clone());
    if let (Some(user), Some(password)) = (&config.username, &config.password) {
        options = options.with_credentials(user.clone(), password.clone());
    }
    let mut session = ClientSession::new(options);

    info!("Connecting to {}", server);
    let connected = connect(
        &socket,
        server,
        &mut session,
        Duration::from_secs(config.handshake_timeout_secs),
        HANDSHAKE_ATTEMPTS,
    )
    .await
    .context("Handshake failed")?;
    if let ClientEvent::Connected {
        session_id,
        mode,
        vpn_address,
    } = connected
    {
        info!("Connected: session {:08x}, mode {}", session_id, mode.display_name());
        if let Some(addr) = vpn_address {
            info!("Assigned tunnel address {}", addr);
        }
    }

    let keepalive_every = Duration::from_secs(config.keepalive_secs);
    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_sent = Instant::now();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(line) => {
                        let datagram = session.seal_data(line.as_bytes())?;
                        sleep(session.jitter()).await;
                        socket.send_to(&datagram, server).await?;
                        last_sent = Instant::now();
                    }
                    None => {
                        debug!("stdin closed");
                        break;
                    }
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received?;
                if from != server {
                    continue;
                }
                let events = match session.handle_datagram(&buf[..len]) {
                    Ok(events) => events,
                    Err(e) => {
                        debug!("Dropping datagram: {}", e);
                        continue;
                    }
                };
                for event in events {
                    match event {
                        ClientEvent::Send(datagram) => {
                            socket.send_to(&datagram, server).await?;
                        }
                        ClientEvent::Data(payload) => {
                            println!("{}", String::from_utf8_lossy(&payload));
                        }
                        ClientEvent::Rekeyed => info!("Session rekeyed ({} total)", session.rekeys()),
                        ClientEvent::Disconnected => {
                            info!("Server closed the session");
                            return Ok(());
                        }
                        ClientEvent::Connected { .. } => {}
                    }
                }
            }
            _ = ticker.tick() => {
                if last_sent.elapsed() >= keepalive_every {
                    let datagram = session.keepalive()?;
                    socket.send_to(&datagram, server).await?;
                    last_sent = Instant::now();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    let goodbye = session.disconnect()?;
    socket.send_to(&goodbye, server).await?;
    info!("Disconnected");
    Ok(())
}
