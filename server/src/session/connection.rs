//! Individual device session handling

use anyhow::{bail, Result};
use devrpc_shared::{codec::{self, FrameDecoder}, Frame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Reader = Box<dyn AsyncRead + Send + Unpin>;

/// Handle to send frames to a specific device
#[derive(Clone)]
pub struct SessionHandle {
    pub device_id: String,
    pub addr: SocketAddr,
    writer: Arc<Mutex<Writer>>,
    pub connected_at: Instant,
    last_heartbeat: Arc<Mutex<Instant>>,
    closed: Arc<Notify>,
}

impl SessionHandle {
    pub fn new<W>(device_id: impl Into<String>, addr: SocketAddr, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let now = Instant::now();
        Self {
            device_id: device_id.into(),
            addr,
            writer: Arc::new(Mutex::new(Box::new(writer))),
            connected_at: now,
            last_heartbeat: Arc::new(Mutex::new(now)),
            closed: Arc::new(Notify::new()),
        }
    }

    /// Send a frame to this device
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let encoded = codec::encode(frame)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Check if the last heartbeat is younger than `timeout`
    pub async fn is_alive(&self, timeout: Duration) -> bool {
        self.time_since_heartbeat().await < timeout
    }

    /// Update the last heartbeat time
    pub async fn update_heartbeat(&self) {
        *self.last_heartbeat.lock().await = Instant::now();
    }

    /// Get time since last heartbeat
    pub async fn time_since_heartbeat(&self) -> Duration {
        self.last_heartbeat.lock().await.elapsed()
    }

    /// Stop the session's read loop and close the write side
    pub async fn close(&self) {
        self.closed.notify_one();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown of {} ({}) failed: {}", self.device_id, self.addr, e);
        }
    }

    pub fn is_same_connection(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.writer, &other.writer)
    }
}

/// Active device session
pub struct DeviceSession {
    handle: SessionHandle,
    reader: Reader,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
}

impl DeviceSession {
    /// Create a new device session from a TCP stream
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_parts(reader, writer, addr)
    }

    /// Create a session over any byte stream halves
    pub fn from_parts<R, W>(reader: R, writer: W, addr: SocketAddr) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            // Set by the Hello frame
            handle: SessionHandle::new(String::new(), addr, writer),
            reader: Box::new(reader),
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
        }
    }

    /// Get a cloneable handle for sending frames
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Wait for the device's Hello frame and adopt its device id
    pub async fn await_hello(&mut self) -> Result<String> {
        match self.recv().await {
            Some(Frame::Hello { device_id }) if !device_id.trim().is_empty() => {
                self.handle.device_id = device_id.clone();
                Ok(device_id)
            }
            Some(Frame::Hello { .. }) => bail!("hello from {} has an empty device id", self.addr()),
            Some(other) => bail!("expected HELLO from {}, got {}", self.addr(), other.kind()),
            None => bail!("connection from {} closed before HELLO", self.addr()),
        }
    }

    /// Read the next frame from this session
    /// Returns None if the connection is closed
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            match self.decoder.decode_next() {
                Ok(Some(frame)) => {
                    if let Frame::Heartbeat { .. } = frame {
                        self.handle.update_heartbeat().await;
                    }
                    return Some(frame);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Decode error from {}: {}", self.handle.addr, e);
                    return None;
                }
            }

            let closed = self.handle.closed.clone();
            tokio::select! {
                _ = closed.notified() => {
                    debug!("Session {} closed locally", self.handle.addr);
                    return None;
                }
                read = self.reader.read(&mut self.read_buf) => match read {
                    Ok(0) => return None,
                    Ok(n) => self.decoder.extend(&self.read_buf[..n]),
                    Err(e) => {
                        warn!("Read error from {}: {}", self.handle.addr, e);
                        return None;
                    }
                },
            }
        }
    }

    /// Get the device ID (empty until Hello was received)
    pub fn device_id(&self) -> &str {
        &self.handle.device_id
    }

    /// Get the remote address
    pub fn addr(&self) -> SocketAddr {
        self.handle.addr
    }
}
