//! Session manager for tracking all connected devices
//!
//! The manager is the server's [`DeviceChannel`]: commands for a connected device are
//! written to its session, commands for an offline device are parked until it
//! reconnects.

use super::connection::SessionHandle;
use crate::config::DeviceConfig;
use crate::rpc::{ChannelEvent, DeviceChannel, DispatchAck, DispatchError};
use async_trait::async_trait;
use devrpc_shared::{now_ms, Frame, RpcRequest};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Manages all active device sessions and the commands waiting for offline devices
pub struct SessionManager {
    config: DeviceConfig,
    /// Map of device_id -> session handle
    sessions: RwLock<HashMap<String, SessionHandle>>,
    /// Commands parked for offline devices, oldest first
    queues: Mutex<HashMap<String, VecDeque<Arc<RpcRequest>>>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl SessionManager {
    pub fn new(config: DeviceConfig, events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Report channel progress to the dispatcher
    pub fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            debug!("Channel event dropped, dispatcher is gone");
        }
    }

    /// Register a device session and flush its queued commands
    ///
    /// Returns the session this one replaced, if the device was already connected.
    pub async fn register(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let device_id = handle.device_id.clone();
        if device_id.is_empty() {
            warn!("Refusing to register session {} without device id", handle.addr);
            return None;
        }

        // Insert under the queue lock so a concurrent dispatch either sees the
        // session or lands in the queue drained here
        let (previous, queued) = {
            let mut queues = self.queues.lock().await;
            let previous = self
                .sessions
                .write()
                .await
                .insert(device_id.clone(), handle.clone());
            (previous, queues.remove(&device_id).unwrap_or_default())
        };

        if !queued.is_empty() {
            self.flush(&handle, queued).await;
        }
        previous
    }

    /// Write queued commands to a freshly connected device
    async fn flush(&self, handle: &SessionHandle, mut queued: VecDeque<Arc<RpcRequest>>) {
        let now = now_ms();
        let total = queued.len();
        let mut sent = 0;

        while let Some(request) = queued.pop_front() {
            if request.is_expired_at(now) {
                debug!("Dropping expired queued call {} for {}", request.id, handle.device_id);
                self.emit(ChannelEvent::Unreachable { id: request.id });
                continue;
            }

            match handle.send(&Frame::request(&request)).await {
                Ok(()) => {
                    sent += 1;
                    self.emit(ChannelEvent::Sent { id: request.id });
                }
                Err(e) => {
                    warn!("Flush to {} failed: {}", handle.device_id, e);
                    queued.push_front(request);
                    let mut queues = self.queues.lock().await;
                    let parked = queues.entry(handle.device_id.clone()).or_default();
                    while let Some(request) = queued.pop_back() {
                        parked.push_front(request);
                    }
                    break;
                }
            }
        }

        info!("Flushed {}/{} queued calls to {}", sent, total, handle.device_id);
    }

    /// Unregister a device session
    ///
    /// Only removes the entry if it still belongs to `handle`; a reconnect may have
    /// replaced it already.
    pub async fn unregister(&self, handle: &SessionHandle) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&handle.device_id) {
            Some(current) if current.is_same_connection(handle) => {
                sessions.remove(&handle.device_id);
                true
            }
            _ => false,
        }
    }

    /// Get a session handle for a specific device
    pub async fn get(&self, device_id: &str) -> Option<SessionHandle> {
        let sessions = self.sessions.read().await;
        sessions.get(device_id).cloned()
    }

    /// Check for dead sessions (heartbeat timeout)
    pub async fn check_dead_sessions(&self) -> Vec<SessionHandle> {
        let sessions = self.sessions.read().await;
        let mut dead = Vec::new();
        for handle in sessions.values() {
            if !handle.is_alive(self.config.heartbeat_timeout()).await {
                dead.push(handle.clone());
            }
        }
        dead
    }

    /// Remove and close dead sessions, returning their device IDs
    pub async fn remove_dead_sessions(&self) -> Vec<String> {
        let mut removed = Vec::new();
        for handle in self.check_dead_sessions().await {
            if self.unregister(&handle).await {
                handle.close().await;
                removed.push(handle.device_id.clone());
            }
        }
        removed
    }

    /// Drop queued commands whose expiration time has passed
    ///
    /// Each dropped command is reported as [`ChannelEvent::Unreachable`].
    pub async fn prune_expired(&self) -> usize {
        let now = now_ms();
        let mut expired = Vec::new();
        {
            let mut queues = self.queues.lock().await;
            for queue in queues.values_mut() {
                queue.retain(|request| {
                    let keep = !request.is_expired_at(now);
                    if !keep {
                        expired.push(request.id);
                    }
                    keep
                });
            }
            queues.retain(|_, queue| !queue.is_empty());
        }

        for id in &expired {
            self.emit(ChannelEvent::Unreachable { id: *id });
        }
        expired.len()
    }

    /// Periodically reap dead sessions and expired queued commands
    pub async fn run_reaper(&self) {
        let mut ticker = tokio::time::interval(self.config.reap_interval());
        loop {
            ticker.tick().await;

            for device_id in self.remove_dead_sessions().await {
                warn!("Device {} missed heartbeats, session dropped", device_id);
            }

            let pruned = self.prune_expired().await;
            if pruned > 0 {
                debug!("Pruned {} expired queued calls", pruned);
            }
        }
    }

    /// Get the number of connected devices
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Get the number of commands waiting for offline devices
    pub async fn queued_count(&self) -> usize {
        self.queues.lock().await.values().map(VecDeque::len).sum()
    }

    async fn write(
        &self,
        handle: &SessionHandle,
        request: &RpcRequest,
    ) -> Result<DispatchAck, DispatchError> {
        match handle.send(&Frame::request(request)).await {
            Ok(()) => Ok(DispatchAck::Sent),
            Err(e) => {
                warn!("Write to {} failed, dropping session: {}", handle.device_id, e);
                if self.unregister(handle).await {
                    handle.close().await;
                }
                Err(DispatchError::Transport(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl DeviceChannel for SessionManager {
    async fn dispatch(&self, request: Arc<RpcRequest>) -> Result<DispatchAck, DispatchError> {
        if let Some(handle) = self.get(&request.device_id).await {
            return self.write(&handle, &request).await;
        }

        if !self.config.queue_while_offline {
            return Err(DispatchError::NotConnected(request.device_id.clone()));
        }

        let mut queues = self.queues.lock().await;
        // The device may have connected since the lookup above
        if let Some(handle) = self.get(&request.device_id).await {
            drop(queues);
            return self.write(&handle, &request).await;
        }

        debug!("Device {} offline, queueing call {}", request.device_id, request.id);
        queues
            .entry(request.device_id.clone())
            .or_default()
            .push_back(request);
        Ok(DispatchAck::Queued)
    }

    async fn withdraw(&self, request: &Arc<RpcRequest>) -> bool {
        let mut queues = self.queues.lock().await;
        let Some(queue) = queues.get_mut(&request.device_id) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|queued| !Arc::ptr_eq(queued, request));
        let withdrawn = queue.len() < before;
        if queue.is_empty() {
            queues.remove(&request.device_id);
        }
        if withdrawn {
            debug!("Withdrew queued call {} for {}", request.id, request.device_id);
        }
        withdrawn
    }

    fn name(&self) -> &'static str {
        "tcp-session"
    }
}
