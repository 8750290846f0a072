mod connection;
mod rpc;

use clap::Parser;
use connection::{ConnectionConfig, ConnectionEvent, ConnectionManager};
use rpc::{IncomingRpc, RpcExecutor};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(about = "Simulated device answering RPC requests from the server")]
struct Args {
    /// Device ID announced to the server
    #[arg(long, default_value = "edge-001")]
    device_id: String,
    /// Server device port
    #[arg(long, default_value = "127.0.0.1:7070")]
    server: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = ConnectionConfig {
        device_id: args.device_id,
        server: args.server,
        ..Default::default()
    };

    info!("Device starting: {}", config.device_id);
    info!("  Server: {}", config.server);

    let mut conn = ConnectionManager::new(config);
    let executor = Arc::new(RpcExecutor::new(
        conn.device_id().to_string(),
        conn.in_flight(),
    ));

    // Main event loop
    loop {
        match conn.recv().await {
            Some(ConnectionEvent::Connected { server }) => {
                info!("Connected to {}", server);
            }
            Some(ConnectionEvent::Disconnected { reason }) => {
                warn!("Disconnected: {}", reason);
            }
            Some(ConnectionEvent::ConnectionFailed { reason, retry_in }) => {
                error!("Connection failed: {} (retrying in {:?})", reason, retry_in);
            }
            Some(ConnectionEvent::Received(frame)) => {
                let kind = frame.kind();
                let Some(request) = IncomingRpc::from_frame(frame) else {
                    debug!("Ignoring {} frame from server", kind);
                    continue;
                };

                let executor = executor.clone();
                let out = conn.get_sender();
                tokio::spawn(async move {
                    if let Err(e) = executor.execute(&request, &out).await {
                        error!("Failed to answer {}: {}", request.id, e);
                    }
                });
            }
            None => {
                info!("Connection manager stopped");
                break;
            }
        }
    }
}
