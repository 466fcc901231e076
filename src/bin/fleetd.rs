//! fleetd - Fleet device agent
//!
//! Keeps this device connected to the fleet orchestration server and runs
//! the automation jobs it dispatches.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default config (<config_dir>/fleet/fleet.toml)
//! fleetd
//!
//! # Register this device with a one-time bind code
//! fleetd --bind ABC123
//!
//! # Point at another server with debug logging
//! fleetd --server wss://fleet.example.com/ws/device --debug
//! ```

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fleetd::config::LoggingSettings;
use fleetd::{
    Agent, AgentError, AgentEvent, AgentHandle, Config, Engine, FileCredentialStore,
    ProcessEngine, WebSocketConnector,
};

/// Fleet device agent
#[derive(Parser, Debug)]
#[command(name = "fleetd", version, about)]
struct Args {
    /// Config file [default: <config_dir>/fleet/fleet.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server WebSocket URL, overrides `server.ws_url`
    #[arg(long)]
    server: Option<String>,

    /// One-time bind code used to register this device
    #[arg(long)]
    bind: Option<String>,

    /// Engine install path reported to the server
    #[arg(long)]
    install_path: Option<String>,

    /// Log at debug level regardless of config and RUST_LOG
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if let Some(server) = &args.server {
        config.server.ws_url = server.clone();
    }
    if let Some(install_path) = &args.install_path {
        config.engine.install_path = install_path.clone();
    }
    config.validate().context("Invalid configuration")?;

    init_logging(&config.logging, args.debug)?;

    run_agent(config, args.bind)
}

fn init_logging(settings: &LoggingSettings, debug: bool) -> Result<()> {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&settings.level))
            .with_context(|| format!("Invalid log level '{}'", settings.level))?
    };

    match &settings.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).context("Failed to create log directory")?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false) // No ANSI colors in log file
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .init();
        }
    }

    Ok(())
}

#[tokio::main]
async fn run_agent(config: Config, bind_code: Option<String>) -> Result<()> {
    // Another crate may already have installed a provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        server = %config.server.ws_url,
        "fleetd starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let store = Arc::new(FileCredentialStore::new(
        config.credentials_path(),
        config.device_name(),
    ));
    info!(path = %store.path().display(), "Using credential store");

    let engine = ProcessEngine::from_settings(&config.engine)
        .map(|engine| Arc::new(engine) as Arc<dyn Engine>);
    match &engine {
        Some(engine) => info!(version = %engine.version(), "Automation engine configured"),
        None => warn!("No automation engine configured, jobs will be rejected"),
    }

    let connector = Arc::new(WebSocketConnector::new(
        config.server.ws_url.clone(),
        config.connect_timeout(),
    ));

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (agent, handle) = Agent::new(
        config.agent_config(),
        connector,
        engine,
        store,
        Some(events_tx),
    );
    tokio::spawn(log_events(events_rx));

    match bind_code {
        Some(code) => handle.register(&code).await.context("Invalid bind code")?,
        None if !handle.has_token().await => spawn_bind_prompt(handle.clone()),
        None => {}
    }

    let exit = agent.run(cancel_token).await;
    info!(exit = ?exit, "fleetd stopped");
    Ok(())
}

/// Reads bind codes from stdin until the agent stops.
///
/// Stdin is read on a plain thread so a pending read never holds up runtime
/// shutdown.
fn spawn_bind_prompt(handle: AgentHandle) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        eprintln!("Device is not registered. Enter the bind code shown on the server:");
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        while let Some(code) = rx.recv().await {
            match handle.register(&code).await {
                Ok(()) => info!("Bind code submitted"),
                Err(AgentError::EmptyBindCode) => eprintln!("Bind code must not be empty"),
                Err(AgentError::NotRunning) => break,
            }
        }
    });
}

async fn log_events(mut events: mpsc::UnboundedReceiver<AgentEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            AgentEvent::Connected => info!("Session established"),
            AgentEvent::Disconnected { reason } => warn!(reason = %reason, "Session ended"),
            AgentEvent::Registered { device_id } => {
                info!(device_id = %device_id, "Device registered")
            }
            AgentEvent::Authenticated {
                device_id,
                user_nickname,
            } => info!(device_id = %device_id, user = %user_nickname, "Device online"),
            AgentEvent::AuthFailed { message } => {
                warn!(reason = %message, "Device token rejected, a new bind code is required")
            }
        }
    }
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
