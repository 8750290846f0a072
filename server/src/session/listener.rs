//! TCP listener that turns device connections into sessions

use super::connection::DeviceSession;
use super::manager::SessionManager;
use crate::rpc::ChannelEvent;
use anyhow::Result;
use devrpc_shared::Frame;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Accept device connections until the listener fails
pub async fn serve(listener: TcpListener, manager: Arc<SessionManager>) -> Result<()> {
    info!("Device listener on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("Connection from: {}", addr);

        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, manager).await {
                warn!("Device connection {} ended: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    manager: Arc<SessionManager>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut session = DeviceSession::new(stream, addr);

    let hello_timeout = manager.config().hello_timeout();
    let device_id = match tokio::time::timeout(hello_timeout, session.await_hello()).await {
        Ok(result) => result?,
        Err(_) => anyhow::bail!("no HELLO within {:?}", hello_timeout),
    };

    let handle = session.handle();
    if let Some(previous) = manager.register(handle.clone()).await {
        info!(
            "Device {} reconnected from {}, closing session from {}",
            device_id, addr, previous.addr
        );
        previous.close().await;
    }
    info!("Device {} connected from {}", device_id, addr);

    while let Some(frame) = session.recv().await {
        match frame {
            Frame::Heartbeat { uptime_ms, pending } => {
                debug!(
                    "[{}] HEARTBEAT: uptime={}ms pending={}",
                    device_id, uptime_ms, pending
                );
            }
            Frame::Ack { id } => manager.emit(ChannelEvent::Delivered {
                id,
                device_id: device_id.clone(),
            }),
            Frame::Response {
                id,
                response,
                error,
            } => manager.emit(ChannelEvent::Response {
                id,
                device_id: device_id.clone(),
                response,
                error,
            }),
            other => {
                warn!("[{}] unexpected {} frame ignored", device_id, other.kind());
            }
        }
    }

    if manager.unregister(&handle).await {
        info!("Device {} disconnected", device_id);
    } else {
        debug!("Replaced session of {} from {} closed", device_id, addr);
    }
    Ok(())
}
