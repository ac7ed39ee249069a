//! displayd - display and window-session control-plane daemon
//!
//! Owns the screen power state machine, the fold manager and every window
//! session, and serves them to clients.
//!
//! # Features
//! - Screen power transitions with timeout-forced recovery
//! - Foldable display-mode tracking
//! - Session lifecycle with per-session vsync pacing
//! - Binder-style transactions, in process or over a local socket
//! - TOML configuration with sensible defaults

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use displayd_core::config::Config;
use displayd_core::DisplayContext;

/// displayd - display control-plane daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run in debug mode with verbose logging
    #[arg(short, long)]
    debug: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Print default configuration to stdout
    #[arg(long)]
    print_default_config: bool,

    /// Socket path for IPC
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Query a running daemon for a value by id and print it
    #[arg(long, value_name = "ID")]
    get_value: Option<i32>,
}

fn init_logging(debug: bool) -> Result<()> {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Handle special commands
    if args.print_default_config {
        println!("{}", Config::default_config_string());
        return Ok(());
    }

    init_logging(args.debug)?;

    if args.validate {
        Config::load(args.config.as_deref()).context("Configuration is invalid")?;
        info!("Configuration is valid");
        return Ok(());
    }

    // Load configuration
    let config = match Config::load(args.config.as_deref()) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        },
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        },
    };
    let socket_path = args.socket.clone().unwrap_or_else(|| config.socket_path());

    if let Some(id) = args.get_value {
        let value = query_value(&socket_path, id)?;
        println!("{value}");
        return Ok(());
    }

    info!("displayd v{} starting...", env!("CARGO_PKG_VERSION"));
    let context = DisplayContext::with_defaults(&config);
    run_daemon(&context, &socket_path)
}

#[cfg(feature = "ipc")]
fn query_value(socket_path: &Path, id: i32) -> Result<String> {
    use std::sync::Arc;

    use displayd_core::manager_service::SESSION_MANAGER_SERVICE_DESCRIPTOR;
    use displayd_core::SessionManagerServiceProxy;
    use displayd_socket::SocketRemote;

    let remote = SocketRemote::connect(socket_path, SESSION_MANAGER_SERVICE_DESCRIPTOR)?;
    let service = SessionManagerServiceProxy::new(Arc::new(remote))
        .context("Socket does not serve the session manager service")?;
    service
        .get_value_by_id(id)
        .with_context(|| format!("GetValueById({id}) failed"))
}

#[cfg(not(feature = "ipc"))]
fn query_value(_socket_path: &Path, _id: i32) -> Result<String> {
    anyhow::bail!("IPC feature not compiled in. Rebuild with --features ipc");
}

#[cfg(feature = "ipc")]
fn run_daemon(context: &DisplayContext, socket_path: &Path) -> Result<()> {
    use displayd_socket::{SocketServer, SOCKET_CALLER};

    let server = SocketServer::bind(socket_path, context.service_handle_for(SOCKET_CALLER))?;
    info!("Listening on {:?}", server.socket_path());
    server.serve()
}

#[cfg(not(feature = "ipc"))]
fn run_daemon(_context: &DisplayContext, _socket_path: &Path) -> Result<()> {
    warn!("IPC feature not compiled in, serving in-process clients only");
    loop {
        std::thread::park();
    }
}
