//! sockbus - remotely-driven socket test nodes
//!
//! `sockbus node` runs a server-side test node: it connects to the harness
//! on the control bus, registers its identity, then starts and stops its
//! managed listening socket on command. The node exits non-zero when the
//! control-bus connection cannot be established — an unreachable harness is
//! terminal for a node.

use clap::{Parser as ClapParser, Subcommand};
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sockbus::config::{BusConfig, ConfigError};
use sockbus::controller::{ControllerEvent, ServerController};
use sockbus::listener::TraceSeverity;

/// sockbus - remotely-driven socket test nodes
#[derive(ClapParser, Debug)]
#[command(name = "sockbus", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a server-side test node controlled by the harness
    Node {
        /// Identity this node registers with the harness
        #[arg(long)]
        client_id: i32,

        /// Harness host address (overrides the config file)
        #[arg(long)]
        harness: Option<String>,

        /// Control-bus port the harness listens on
        #[arg(long, env = "SOCKBUS_CONTROL_PORT")]
        control_port: Option<u16>,

        /// Path to a TOML config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Error, Debug)]
enum SockbusError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("control bus connection failed — is the harness running?")]
    ControlBusFailed,
}

#[tokio::main]
async fn main() -> Result<(), SockbusError> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Node {
            client_id,
            harness,
            control_port,
            config,
        } => run_node(client_id, harness, control_port, config).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sockbus=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_node(
    client_id: i32,
    harness: Option<String>,
    control_port: Option<u16>,
    config_path: Option<PathBuf>,
) -> Result<(), SockbusError> {
    let mut config = match config_path {
        Some(path) => BusConfig::load(&path)?.unwrap_or_default(),
        None => BusConfig::default(),
    };
    if let Some(address) = harness {
        config.harness_address = address;
    }
    if let Some(port) = control_port {
        config.control_port = port;
    }

    tracing::info!(
        client_id,
        address = %config.harness_address,
        port = config.control_port,
        "sockbus node starting"
    );

    let controller = ServerController::new(client_id, &config);
    let mut events = controller.subscribe();

    // The token makes the handshake wait interruptible; Ctrl+C before the
    // link is up abandons it instead of riding out the full timeout.
    let cancel = CancellationToken::new();
    let handshake_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handshake_cancel.cancel();
        }
    });

    controller.start(&cancel).await;
    if cancel.is_cancelled() {
        controller.shutdown().await;
        tracing::info!("sockbus node exiting");
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("received Ctrl+C");
                if let Err(e) = controller.stop_all().await {
                    tracing::warn!(error = %e, "error during shutdown");
                }
                controller.shutdown().await;
                tracing::info!("sockbus node exiting");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(ControllerEvent::ControlBusConnectionFailed) => {
                    controller.shutdown().await;
                    return Err(SockbusError::ControlBusFailed);
                }
                Ok(event) => log_event(event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    tracing::debug!("event channel closed");
                    return Ok(());
                }
            }
        }
    }
}

fn log_event(event: ControllerEvent) {
    match event {
        ControllerEvent::ListenerStatusChanged(status) => {
            tracing::info!(?status, "listener status changed");
        }
        ControllerEvent::Trace(trace) => match trace.severity {
            TraceSeverity::Info => tracing::info!(message = %trace.message, "listener trace"),
            TraceSeverity::Warning => tracing::warn!(message = %trace.message, "listener trace"),
            TraceSeverity::Error => tracing::error!(message = %trace.message, "listener trace"),
        },
        ControllerEvent::MessageReceived { client_id, params } => {
            tracing::debug!(client_id, params = params.len(), "data-plane message received");
        }
        ControllerEvent::RequestReceived { client_id, params } => {
            tracing::debug!(client_id, params = params.len(), "data-plane request received");
        }
        ControllerEvent::ClientsChanged(count) => {
            tracing::info!(clients = count, "connected client count changed");
        }
        ControllerEvent::ControlBusConnectionFailed => {
            tracing::error!("control bus connection failed");
        }
        ControllerEvent::ExceptionRaised(message) => {
            tracing::error!(%message, "exception raised");
        }
    }
}
