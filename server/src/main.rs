use anyhow::Context;
use clap::Parser;
use devrpc_server::config::ServerConfig;
use devrpc_server::http::{self, AppState};
use devrpc_server::rpc::{InMemoryRpcStore, RpcDispatcher};
use devrpc_server::session::{self, SessionManager};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(about = "Device RPC correlation server")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<String>,
    /// Override `http_addr`
    #[arg(long)]
    http_addr: Option<SocketAddr>,
    /// Override `device_addr`
    #[arg(long)]
    device_addr: Option<SocketAddr>,
    /// Print a sample configuration and exit
    #[arg(long)]
    example_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.example_config {
        println!("{}", ServerConfig::example_toml());
        return Ok(());
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let mut config = match args.config.as_ref() {
        Some(path) => ServerConfig::from_path(path)?,
        None => ServerConfig::default(),
    };
    if let Some(addr) = args.http_addr {
        config.http_addr = addr;
    }
    if let Some(addr) = args.device_addr {
        config.device_addr = addr;
    }
    config.validate()?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let sessions = Arc::new(SessionManager::new(config.devices.clone(), events_tx));
    let store = Arc::new(InMemoryRpcStore::new());
    let (dispatcher, feed) = RpcDispatcher::new(config.rpc.clone(), sessions.clone(), store);
    let background = dispatcher.spawn_background(feed, events_rx);

    let reaper = sessions.clone();
    tokio::spawn(async move { reaper.run_reaper().await });

    let device_listener = TcpListener::bind(config.device_addr)
        .await
        .with_context(|| format!("binding device listener on {}", config.device_addr))?;
    let device_sessions = sessions.clone();
    tokio::spawn(async move {
        if let Err(e) = session::serve(device_listener, device_sessions).await {
            error!("Device listener stopped: {}", e);
        }
    });

    let state = AppState::new(dispatcher.clone(), &config)?;
    let app = http::router(state);
    let http_listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("binding HTTP listener on {}", config.http_addr))?;
    info!("HTTP API listening on {}", config.http_addr);

    axum::serve(http_listener, app)
        .with_graceful_shutdown(shutdown_signal(dispatcher.clone()))
        .await?;

    for task in background {
        task.abort();
    }
    info!("Server stopped");
    Ok(())
}

/// Wait for ctrl-c, then cancel in-flight calls so open requests can complete
async fn shutdown_signal(dispatcher: Arc<RpcDispatcher>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
    }
    info!("Shutdown requested");
    dispatcher.shutdown();
}
