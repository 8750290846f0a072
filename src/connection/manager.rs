//! Connection manager with a persistent server connection and automatic reconnection

use anyhow::{anyhow, Result};
use devrpc_shared::{
    codec::{self, FrameDecoder},
    timing, Frame,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Instant};

/// Events emitted by the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Connected and introduced to the server
    Connected { server: String },
    /// Disconnected from server
    Disconnected { reason: String },
    /// Received a frame from server
    Received(Frame),
    /// A connection attempt failed; another follows after the backoff delay
    ConnectionFailed { reason: String, retry_in: Duration },
}

/// Configuration for connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Device ID announced in the Hello frame
    pub device_id: String,
    /// Server device port address
    pub server: String,
    /// Reconnection delay (initial)
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay
    pub max_reconnect_delay: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            device_id: "edge-001".into(),
            server: "127.0.0.1:7070".into(),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_millis(timing::HEARTBEAT_INTERVAL_MS),
        }
    }
}

/// Manages the persistent connection to the server
pub struct ConnectionManager {
    config: ConnectionConfig,
    /// Requests currently executing, reported in heartbeats
    in_flight: Arc<AtomicU32>,
    /// Channel to send frames to the server
    outbound_tx: mpsc::Sender<Frame>,
    /// Channel to receive connection events
    event_rx: mpsc::Receiver<ConnectionEvent>,
}

impl ConnectionManager {
    /// Create a new connection manager and start the connection loop
    pub fn new(config: ConnectionConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(100);
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(100);
        let in_flight = Arc::new(AtomicU32::new(0));

        let config_clone = config.clone();
        let in_flight_clone = in_flight.clone();
        tokio::spawn(async move {
            connection_loop(config_clone, in_flight_clone, outbound_rx, event_tx).await;
        });

        Self {
            config,
            in_flight,
            outbound_tx,
            event_rx,
        }
    }

    /// Send a frame to the server
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|_| anyhow!("Connection closed"))
    }

    /// Receive the next connection event
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.event_rx.recv().await
    }

    /// Get the device ID
    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    /// Get a clone of the sender for outbound frames
    pub fn get_sender(&self) -> mpsc::Sender<Frame> {
        self.outbound_tx.clone()
    }

    /// Counter of executing requests, shared with the executor
    pub fn in_flight(&self) -> Arc<AtomicU32> {
        self.in_flight.clone()
    }
}

/// Main connection loop with reconnection logic
async fn connection_loop(
    config: ConnectionConfig,
    in_flight: Arc<AtomicU32>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    event_tx: mpsc::Sender<ConnectionEvent>,
) {
    let mut reconnect_delay = config.reconnect_delay;

    loop {
        match timeout(config.connect_timeout, TcpStream::connect(&config.server)).await {
            Ok(Ok(stream)) => {
                reconnect_delay = config.reconnect_delay;

                let result =
                    handle_connection(stream, &config, &in_flight, &mut outbound_rx, &event_tx)
                        .await;
                let reason = match result {
                    Ok(()) => return,
                    Err(reason) => reason.to_string(),
                };
                if event_tx
                    .send(ConnectionEvent::Disconnected { reason })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(Err(e)) => {
                let event = ConnectionEvent::ConnectionFailed {
                    reason: e.to_string(),
                    retry_in: reconnect_delay,
                };
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
            Err(_) => {
                let event = ConnectionEvent::ConnectionFailed {
                    reason: format!("connect timed out after {:?}", config.connect_timeout),
                    retry_in: reconnect_delay,
                };
                if event_tx.send(event).await.is_err() {
                    return;
                }
            }
        }

        tokio::time::sleep(reconnect_delay).await;

        // Exponential backoff
        reconnect_delay = std::cmp::min(reconnect_delay * 2, config.max_reconnect_delay);
    }
}

/// Handle an active connection
///
/// Returns `Ok(())` only when the manager was dropped and the loop should stop.
async fn handle_connection(
    stream: TcpStream,
    config: &ConnectionConfig,
    in_flight: &AtomicU32,
    outbound_rx: &mut mpsc::Receiver<Frame>,
    event_tx: &mpsc::Sender<ConnectionEvent>,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let hello = codec::encode(&Frame::Hello {
        device_id: config.device_id.clone(),
    })?;
    writer.write_all(&hello).await?;

    if event_tx
        .send(ConnectionEvent::Connected {
            server: config.server.clone(),
        })
        .await
        .is_err()
    {
        return Ok(());
    }

    let mut decoder = FrameDecoder::new();
    let mut read_buf = vec![0u8; 4096];
    let mut heartbeat_interval = interval(config.heartbeat_interval);
    let start_time = Instant::now();

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                let heartbeat = Frame::Heartbeat {
                    uptime_ms: start_time.elapsed().as_millis() as u64,
                    pending: in_flight.load(Ordering::Relaxed),
                };
                writer.write_all(&codec::encode(&heartbeat)?).await?;
            }

            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(frame) => writer.write_all(&codec::encode(&frame)?).await?,
                    None => return Ok(()),
                }
            }

            result = reader.read(&mut read_buf) => {
                match result {
                    Ok(0) => return Err(anyhow!("Server closed connection")),
                    Ok(n) => {
                        decoder.extend(&read_buf[..n]);
                        while let Some(frame) = decoder.decode_next()? {
                            if event_tx.send(ConnectionEvent::Received(frame)).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Err(e) => return Err(anyhow!("Read error: {}", e)),
                }
            }
        }
    }
}
