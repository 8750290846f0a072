//! RPC dispatcher: turns a caller's request into a correlated, awaited call
//!
//! Submission registers the call, arms its deadline and hands the command to the
//! device channel from a background task, so the caller only ever waits on the
//! registry. Channel progress and every winning resolution flow back through
//! [`RpcDispatcher::handle_event`] and [`RpcDispatcher::on_resolved`].

use super::channel::{ChannelEvent, DeviceChannel, DispatchAck};
use super::registry::{CorrelationRegistry, PendingCallHandle, RegistryError, Resolution};
use super::store::{RpcRecord, RpcStore};
use super::timeout::TimeoutScheduler;
use crate::config::RpcConfig;
use devrpc_shared::{now_ms, RpcId, RpcOutcome, RpcRequest, RpcStatus};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Submission failures; none of these ever reach the registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request id {0} is already pending")]
    DuplicateId(RpcId),

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

impl From<RegistryError> for SubmitError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateId(id) => SubmitError::DuplicateId(id),
            RegistryError::Closed => SubmitError::ShuttingDown,
        }
    }
}

/// Caller input before validation and defaulting
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub id: Option<RpcId>,
    pub tenant_id: String,
    pub device_id: String,
    pub one_way: bool,
    pub method: Option<String>,
    pub params: Option<String>,
    /// Relative timeout; the configured default applies when absent
    pub timeout_ms: Option<u64>,
    /// Absolute deadline overriding `timeout_ms`
    pub expiration_time: Option<u64>,
    pub persisted: bool,
    pub retries: Option<u32>,
    pub additional_info: Option<serde_json::Value>,
}

/// A submitted call, awaited through [`RpcCall::outcome`]
pub struct RpcCall {
    registry: Arc<CorrelationRegistry>,
    handle: PendingCallHandle,
}

impl fmt::Debug for RpcCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let request = self.handle.request();
        f.debug_struct("RpcCall")
            .field("id", &request.id)
            .field("device_id", &request.device_id)
            .field("method", &request.method)
            .finish_non_exhaustive()
    }
}

impl RpcCall {
    pub fn id(&self) -> RpcId {
        self.handle.id()
    }

    pub fn request(&self) -> &Arc<RpcRequest> {
        self.handle.request()
    }

    /// Wait for the winning resolution of this call
    pub async fn outcome(self) -> RpcOutcome {
        self.registry.wait(self.handle, None).await
    }
}

pub struct RpcDispatcher {
    config: RpcConfig,
    registry: Arc<CorrelationRegistry>,
    timeouts: TimeoutScheduler,
    channel: Arc<dyn DeviceChannel>,
    store: Arc<dyn RpcStore>,
}

impl RpcDispatcher {
    /// Create a dispatcher with its own registry, returning the registry's resolution feed
    pub fn new(
        config: RpcConfig,
        channel: Arc<dyn DeviceChannel>,
        store: Arc<dyn RpcStore>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Resolution>) {
        let (registry, feed) = CorrelationRegistry::new();
        let dispatcher = Arc::new(Self {
            config,
            timeouts: TimeoutScheduler::new(registry.clone()),
            registry,
            channel,
            store,
        });
        (dispatcher, feed)
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    pub fn timeouts(&self) -> &TimeoutScheduler {
        &self.timeouts
    }

    pub fn store(&self) -> &Arc<dyn RpcStore> {
        &self.store
    }

    /// Validate, register and start delivering a call
    ///
    /// Returns once the call is registered and its deadline armed; dispatch to the
    /// device runs in the background.
    pub async fn submit(self: &Arc<Self>, submit: SubmitRequest) -> Result<RpcCall, SubmitError> {
        let (request, deadline) = self.build_request(submit)?;
        let id = request.id;
        let expired = deadline.is_none();

        let handle = self.registry.register(request)?;
        let request = handle.request().clone();

        if let Some(deadline) = deadline {
            self.timeouts.arm(&request, deadline);
        }

        if request.persisted {
            if let Err(e) = self.store.insert(RpcRecord::queued((*request).clone())).await {
                warn!("Failed to store rpc {}: {}", id, e);
            }
        }

        if expired {
            debug!("Call {} expired before dispatch", id);
            self.registry.resolve_call(&request, RpcOutcome::Timeout);
        } else {
            let dispatcher = self.clone();
            tokio::spawn(async move { dispatcher.deliver(request).await });
        }

        Ok(RpcCall {
            registry: self.registry.clone(),
            handle,
        })
    }

    /// Apply defaults and compute the deadline; `None` means already expired
    fn build_request(
        &self,
        submit: SubmitRequest,
    ) -> Result<(RpcRequest, Option<Instant>), SubmitError> {
        let method = submit
            .method
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| SubmitError::Malformed("method is required".into()))?;
        if submit.device_id.trim().is_empty() {
            return Err(SubmitError::Malformed("device id is required".into()));
        }

        let now = now_ms();
        let (expiration_time, deadline) = match submit.expiration_time {
            Some(at) if at <= now => (at, None),
            Some(at) => (at, Some(Instant::now() + Duration::from_millis(at - now))),
            None => {
                let timeout_ms = submit
                    .timeout_ms
                    .unwrap_or(self.config.default_timeout_ms)
                    .max(self.config.min_timeout_ms);
                (
                    now.saturating_add(timeout_ms),
                    Some(Instant::now() + Duration::from_millis(timeout_ms)),
                )
            }
        };

        let request = RpcRequest {
            id: submit.id.unwrap_or_default(),
            tenant_id: submit.tenant_id,
            device_id: submit.device_id,
            one_way: submit.one_way,
            method,
            params: submit.params.unwrap_or_default(),
            expiration_time,
            persisted: submit.persisted,
            retries: submit.retries,
            additional_info: submit.additional_info,
        };
        Ok((request, deadline))
    }

    /// Hand the command to the channel, retrying immediate failures
    async fn deliver(&self, request: Arc<RpcRequest>) {
        let id = request.id;
        let attempts = request.retries.unwrap_or(0).saturating_add(1);

        for attempt in 1..=attempts {
            if !self.registry.is_current(&request) {
                debug!("Call {} resolved before dispatch attempt {}", id, attempt);
                return;
            }

            match self.channel.dispatch(request.clone()).await {
                Ok(DispatchAck::Sent) => {
                    self.on_sent(&request).await;
                    return;
                }
                Ok(DispatchAck::Queued) => {
                    debug!("Call {} queued for offline device {}", id, request.device_id);
                    // Resolved while being parked: on_resolved may have missed it
                    if !self.registry.is_current(&request) {
                        self.channel.withdraw(&request).await;
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        "Dispatch of {} to {} failed (attempt {}/{}): {}",
                        id, request.device_id, attempt, attempts, e
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }

        warn!(
            "Giving up on {} after {} dispatch attempts via {}",
            id,
            attempts,
            self.channel.name()
        );
        if self
            .registry
            .resolve_call(&request, RpcOutcome::NoActiveConnection)
        {
            self.timeouts.disarm(&request);
        }
    }

    /// The command reached a device connection
    async fn on_sent(&self, request: &Arc<RpcRequest>) {
        let id = request.id;
        if !self.registry.mark_sent(request) {
            return;
        }

        if request.persisted {
            self.update_store(id, RpcStatus::Sent, None).await;
        }

        if request.one_way {
            self.timeouts.disarm(request);
            self.registry
                .resolve_call(request, RpcOutcome::Success { response: None });
        }
    }

    /// The call `id` if `device_id` is the device it was addressed to
    fn call_from_device(&self, id: RpcId, device_id: &str) -> Option<Arc<RpcRequest>> {
        let Some(request) = self.registry.request(id) else {
            debug!("Event from {} for unknown call {}", device_id, id);
            return None;
        };
        if request.device_id != device_id {
            warn!(
                "Device {} reported on call {} addressed to {}, ignored",
                device_id, id, request.device_id
            );
            return None;
        }
        Some(request)
    }

    /// Apply a progress report from the device channel
    pub async fn handle_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Sent { id } => match self.registry.request(id) {
                Some(request) => self.on_sent(&request).await,
                None => debug!("Sent event for unknown call {}", id),
            },
            ChannelEvent::Delivered { id, device_id } => {
                let Some(request) = self.call_from_device(id, &device_id) else {
                    return;
                };
                self.registry.mark_sent(&request);
                if request.persisted && self.registry.is_current(&request) {
                    self.update_store(id, RpcStatus::Delivered, None).await;
                }
            }
            ChannelEvent::Response {
                id,
                device_id,
                response,
                error,
            } => {
                if let Some(request) = self.call_from_device(id, &device_id) {
                    self.registry
                        .resolve_call(&request, RpcOutcome::from_reply(response, error));
                }
            }
            ChannelEvent::Unreachable { id } => {
                self.registry.resolve(id, RpcOutcome::NoActiveConnection);
            }
        }
    }

    /// Follow-up work for a winning resolution
    ///
    /// Timer and channel cleanup only touch what belongs to this exact request. If the
    /// id was reused by a newer call in the meantime, its audit record is left alone.
    pub async fn on_resolved(&self, resolution: Resolution) {
        let request = &resolution.request;
        let id = request.id;
        self.timeouts.disarm(request);
        if self.channel.withdraw(request).await {
            debug!("Withdrew undelivered command {} from {}", id, self.channel.name());
        }

        if self.registry.is_superseded(request) {
            debug!("Call {} was resubmitted, skipping its audit update", id);
            return;
        }

        if request.persisted {
            let response = match &resolution.outcome {
                RpcOutcome::Success { response } => response.clone(),
                _ => None,
            };
            self.update_store(id, RpcStatus::from_outcome(&resolution.outcome), response)
                .await;
        }
    }

    async fn update_store(&self, id: RpcId, status: RpcStatus, response: Option<String>) {
        if let Err(e) = self.store.update_status(id, status, response).await {
            warn!("Failed to update stored rpc {}: {}", id, e);
        }
    }

    /// Resolve `id` as cancelled; `false` if it was already resolved or unknown
    pub fn cancel(&self, id: RpcId) -> bool {
        let cancelled = self.registry.resolve(id, RpcOutcome::Cancelled);
        if cancelled {
            self.timeouts.cancel(id);
            debug!("Call {} cancelled", id);
        }
        cancelled
    }

    /// Reject new calls and cancel everything in flight
    pub fn shutdown(&self) -> usize {
        let cancelled = self.registry.close();
        self.timeouts.cancel_all();
        info!("Dispatcher shut down, {} pending calls cancelled", cancelled);
        cancelled
    }

    pub fn pending_count(&self) -> usize {
        self.registry.pending_count()
    }

    /// Consume the registry's resolution feed
    pub async fn run_resolutions(&self, mut feed: mpsc::UnboundedReceiver<Resolution>) {
        while let Some(resolution) = feed.recv().await {
            self.on_resolved(resolution).await;
        }
    }

    /// Consume progress reports from the device channel
    pub async fn run_events(&self, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
    }

    /// Periodically evict resolved calls past their grace period
    pub async fn run_sweeper(&self) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        loop {
            interval.tick().await;
            let evicted = self.registry.sweep(self.config.resolved_grace());
            if evicted > 0 {
                debug!("Evicted {} resolved calls", evicted);
            }
        }
    }

    /// Spawn the resolution, event and sweeper loops
    pub fn spawn_background(
        self: &Arc<Self>,
        feed: mpsc::UnboundedReceiver<Resolution>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Vec<JoinHandle<()>> {
        let resolutions = {
            let dispatcher = self.clone();
            tokio::spawn(async move { dispatcher.run_resolutions(feed).await })
        };
        let channel_events = {
            let dispatcher = self.clone();
            tokio::spawn(async move { dispatcher.run_events(events).await })
        };
        let sweeper = {
            let dispatcher = self.clone();
            tokio::spawn(async move { dispatcher.run_sweeper().await })
        };
        vec![resolutions, channel_events, sweeper]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::channel::DispatchError;
    use crate::rpc::store::InMemoryRpcStore;
    use async_trait::async_trait;
    use devrpc_shared::DeviceErrorKind;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Channel that replays scripted acks and records every dispatch
    #[derive(Default)]
    struct MockChannel {
        script: Mutex<VecDeque<Result<DispatchAck, DispatchError>>>,
        dispatched: Mutex<Vec<Arc<RpcRequest>>>,
        withdrawn: Mutex<Vec<RpcId>>,
    }

    impl MockChannel {
        fn scripted(script: Vec<Result<DispatchAck, DispatchError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            })
        }

        fn attempts(&self) -> usize {
            self.dispatched.lock().unwrap().len()
        }

        fn withdrawn(&self) -> Vec<RpcId> {
            self.withdrawn.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeviceChannel for MockChannel {
        async fn dispatch(
            &self,
            request: Arc<RpcRequest>,
        ) -> Result<DispatchAck, DispatchError> {
            self.dispatched.lock().unwrap().push(request);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(DispatchAck::Sent))
        }

        async fn withdraw(&self, request: &Arc<RpcRequest>) -> bool {
            self.withdrawn.lock().unwrap().push(request.id);
            true
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }

    fn offline() -> Result<DispatchAck, DispatchError> {
        Err(DispatchError::NotConnected("edge-001".into()))
    }

    fn config() -> RpcConfig {
        RpcConfig {
            min_timeout_ms: 5_000,
            default_timeout_ms: 10_000,
            ..RpcConfig::default()
        }
    }

    fn setup(
        channel: Arc<MockChannel>,
    ) -> (
        Arc<RpcDispatcher>,
        mpsc::UnboundedReceiver<Resolution>,
        Arc<InMemoryRpcStore>,
    ) {
        let store = Arc::new(InMemoryRpcStore::new());
        let (dispatcher, feed) = RpcDispatcher::new(config(), channel, store.clone());
        (dispatcher, feed, store)
    }

    fn two_way(method: &str) -> SubmitRequest {
        SubmitRequest {
            tenant_id: "tenant-a".into(),
            device_id: "edge-001".into(),
            method: Some(method.into()),
            params: Some("{}".into()),
            ..SubmitRequest::default()
        }
    }

    async fn until<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn stored_status(store: &InMemoryRpcStore, id: RpcId) -> Option<RpcStatus> {
        store
            .get("tenant-a", id)
            .await
            .expect("get")
            .map(|record| record.status)
    }

    #[tokio::test]
    async fn test_missing_method_is_malformed() {
        let channel = MockChannel::scripted(vec![]);
        let (dispatcher, _feed, _store) = setup(channel.clone());

        let mut req = two_way("getValue");
        req.method = None;
        assert!(matches!(
            dispatcher.submit(req).await,
            Err(SubmitError::Malformed(_))
        ));

        let mut req = two_way("getValue");
        req.device_id = String::new();
        assert!(matches!(
            dispatcher.submit(req).await,
            Err(SubmitError::Malformed(_))
        ));

        assert!(dispatcher.registry().is_empty());
        assert_eq!(channel.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_at_floor_not_before() {
        let channel = MockChannel::scripted(vec![]);
        let (dispatcher, _feed, _store) = setup(channel);

        let mut req = two_way("getValue");
        req.timeout_ms = Some(1_000);
        let start = Instant::now();
        let call = dispatcher.submit(req).await.expect("submit");

        assert_eq!(call.outcome().await, RpcOutcome::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(5_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_applies() {
        let channel = MockChannel::scripted(vec![]);
        let (dispatcher, _feed, _store) = setup(channel);

        let start = Instant::now();
        let call = dispatcher.submit(two_way("getValue")).await.expect("submit");
        assert_eq!(call.outcome().await, RpcOutcome::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_way_short_circuits_on_send() {
        let channel = MockChannel::scripted(vec![]);
        let (dispatcher, _feed, _store) = setup(channel.clone());

        let mut req = two_way("reboot");
        req.one_way = true;
        req.timeout_ms = Some(600_000);
        let start = Instant::now();
        let call = dispatcher.submit(req).await.expect("submit");

        assert_eq!(
            call.outcome().await,
            RpcOutcome::Success { response: None }
        );
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(channel.attempts(), 1);
        assert_eq!(dispatcher.timeouts().armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_get_value() {
        let channel = MockChannel::scripted(vec![]);
        let (dispatcher, _feed, _store) = setup(channel.clone());

        let mut req = two_way("getValue");
        req.timeout_ms = Some(5_000);
        let call = dispatcher.submit(req).await.expect("submit");
        let id = call.id();

        let device = dispatcher.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_200)).await;
            device
                .handle_event(ChannelEvent::Response {
                    id,
                    device_id: "edge-001".into(),
                    response: Some(r#"{"value":42}"#.into()),
                    error: None,
                })
                .await;
        });

        assert_eq!(
            call.outcome().await,
            RpcOutcome::Success {
                response: Some(r#"{"value":42}"#.into())
            }
        );
        assert_eq!(channel.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_no_reply_times_out() {
        let channel = MockChannel::scripted(vec![]);
        let (dispatcher, _feed, _store) = setup(channel);

        let mut req = two_way("getValue");
        req.timeout_ms = Some(5_000);
        let start = Instant::now();
        let call = dispatcher.submit(req).await.expect("submit");
        let id = call.id();

        assert_eq!(call.outcome().await, RpcOutcome::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(5_000));

        // A reply that shows up afterwards changes nothing
        dispatcher
            .handle_event(ChannelEvent::Response {
                id,
                device_id: "edge-001".into(),
                response: Some("{}".into()),
                error: None,
            })
            .await;
        assert_eq!(dispatcher.registry().outcome(id), Some(RpcOutcome::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_is_no_active_connection() {
        let channel = MockChannel::scripted(vec![offline(), offline(), offline()]);
        let (dispatcher, _feed, _store) = setup(channel.clone());

        let mut req = two_way("getValue");
        req.retries = Some(2);
        let start = Instant::now();
        let call = dispatcher.submit(req).await.expect("submit");

        assert_eq!(call.outcome().await, RpcOutcome::NoActiveConnection);
        assert_eq!(channel.attempts(), 3);
        assert_eq!(dispatcher.timeouts().armed_count(), 0);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let channel = MockChannel::scripted(vec![offline(), Ok(DispatchAck::Sent)]);
        let (dispatcher, _feed, _store) = setup(channel.clone());

        let mut req = two_way("getValue");
        req.retries = Some(3);
        let call = dispatcher.submit(req).await.expect("submit");
        let id = call.id();

        until(|| channel.attempts() == 2).await;
        dispatcher
            .handle_event(ChannelEvent::Response {
                id,
                device_id: "edge-001".into(),
                response: None,
                error: Some(DeviceErrorKind::Rejected),
            })
            .await;

        assert_eq!(
            call.outcome().await,
            RpcOutcome::DeviceError {
                kind: DeviceErrorKind::Rejected
            }
        );
        assert_eq!(channel.attempts(), 2);
    }

    #[tokio::test]
    async fn test_no_retries_means_single_attempt() {
        let channel = MockChannel::scripted(vec![offline(), Ok(DispatchAck::Sent)]);
        let (dispatcher, _feed, _store) = setup(channel.clone());

        let call = dispatcher.submit(two_way("getValue")).await.expect("submit");
        assert_eq!(call.outcome().await, RpcOutcome::NoActiveConnection);
        assert_eq!(channel.attempts(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let channel = MockChannel::scripted(vec![]);
        let (dispatcher, _feed, _store) = setup(channel);

        let id = RpcId::new();
        let mut req = two_way("getValue");
        req.id = Some(id);
        let first = dispatcher.submit(req.clone()).await.expect("submit");

        assert_eq!(
            dispatcher.submit(req).await.unwrap_err(),
            SubmitError::DuplicateId(id)
        );
        assert!(dispatcher.registry().is_pending(first.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_call_without_device_is_no_active_connection() {
        let channel = MockChannel::scripted(vec![Ok(DispatchAck::Queued)]);
        let (dispatcher, _feed, _store) = setup(channel);

        let call = dispatcher.submit(two_way("getValue")).await.expect("submit");
        assert_eq!(call.outcome().await, RpcOutcome::NoActiveConnection);
    }

    #[tokio::test]
    async fn test_queued_one_way_resolves_when_sent() {
        let channel = MockChannel::scripted(vec![Ok(DispatchAck::Queued)]);
        let (dispatcher, _feed, _store) = setup(channel.clone());

        let mut req = two_way("reboot");
        req.one_way = true;
        let call = dispatcher.submit(req).await.expect("submit");
        let id = call.id();

        until(|| channel.attempts() == 1).await;
        assert!(dispatcher.registry().is_pending(id));

        dispatcher.handle_event(ChannelEvent::Sent { id }).await;
        assert_eq!(
            call.outcome().await,
            RpcOutcome::Success { response: None }
        );
    }

    #[tokio::test]
    async fn test_unreachable_event() {
        let channel = MockChannel::scripted(vec![Ok(DispatchAck::Queued)]);
        let (dispatcher, _feed, _store) = setup(channel);

        let call = dispatcher.submit(two_way("getValue")).await.expect("submit");
        let id = call.id();
        dispatcher.handle_event(ChannelEvent::Unreachable { id }).await;
        assert_eq!(call.outcome().await, RpcOutcome::NoActiveConnection);
    }

    #[tokio::test]
    async fn test_cancel_races_like_any_resolver() {
        let channel = MockChannel::scripted(vec![]);
        let (dispatcher, _feed, _store) = setup(channel);

        let call = dispatcher.submit(two_way("getValue")).await.expect("submit");
        let id = call.id();

        assert!(dispatcher.cancel(id));
        assert!(!dispatcher.cancel(id));
        assert_eq!(call.outcome().await, RpcOutcome::Cancelled);
        assert_eq!(dispatcher.timeouts().armed_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_override_resolves_without_dispatch() {
        let channel = MockChannel::scripted(vec![]);
        let (dispatcher, _feed, _store) = setup(channel.clone());

        let mut req = two_way("getValue");
        req.expiration_time = Some(now_ms().saturating_sub(1_000));
        let call = dispatcher.submit(req).await.expect("submit");

        assert_eq!(call.outcome().await, RpcOutcome::Timeout);
        assert_eq!(channel.attempts(), 0);
        assert_eq!(dispatcher.timeouts().armed_count(), 0);
    }

    #[tokio::test]
    async fn test_persisted_call_records_lifecycle() {
        let channel = MockChannel::scripted(vec![]);
        let (dispatcher, mut feed, store) = setup(channel.clone());

        let mut req = two_way("getValue");
        req.persisted = true;
        let call = dispatcher.submit(req).await.expect("submit");
        let id = call.id();

        for _ in 0..100 {
            if stored_status(&store, id).await == Some(RpcStatus::Sent) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stored_status(&store, id).await, Some(RpcStatus::Sent));
        assert_eq!(channel.attempts(), 1);

        dispatcher
            .handle_event(ChannelEvent::Delivered {
                id,
                device_id: "edge-001".into(),
            })
            .await;
        assert_eq!(stored_status(&store, id).await, Some(RpcStatus::Delivered));

        dispatcher
            .handle_event(ChannelEvent::Response {
                id,
                device_id: "edge-001".into(),
                response: Some(r#"{"value":7}"#.into()),
                error: None,
            })
            .await;
        dispatcher.on_resolved(feed.recv().await.expect("resolution")).await;

        let record = store.get("tenant-a", id).await.expect("get").expect("record");
        assert_eq!(record.status, RpcStatus::Successful);
        assert_eq!(record.response.as_deref(), Some(r#"{"value":7}"#));
        assert!(call.outcome().await.is_success());
    }

    #[tokio::test]
    async fn test_non_persisted_call_not_stored() {
        let channel = MockChannel::scripted(vec![]);
        let (dispatcher, mut feed, store) = setup(channel);

        let call = dispatcher.submit(two_way("getValue")).await.expect("submit");
        dispatcher.cancel(call.id());
        dispatcher.on_resolved(feed.recv().await.expect("resolution")).await;

        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_rejects() {
        let channel = MockChannel::scripted(vec![Ok(DispatchAck::Queued)]);
        let (dispatcher, _feed, _store) = setup(channel);

        let call = dispatcher.submit(two_way("getValue")).await.expect("submit");
        assert_eq!(dispatcher.shutdown(), 1);
        assert_eq!(call.outcome().await, RpcOutcome::Cancelled);
        assert_eq!(
            dispatcher.submit(two_way("getValue")).await.unwrap_err(),
            SubmitError::ShuttingDown
        );
    }

    #[tokio::test]
    async fn test_call_debug_names_request() {
        let channel = MockChannel::scripted(vec![Ok(DispatchAck::Queued)]);
        let (dispatcher, _feed, _store) = setup(channel);

        let call = dispatcher.submit(two_way("getValue")).await.expect("submit");
        let rendered = format!("{:?}", call);
        assert!(rendered.contains(&call.id().to_string()));
        assert!(rendered.contains("getValue"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubmitted_id_survives_earlier_resolution() {
        let channel = MockChannel::scripted(vec![]);
        let (dispatcher, mut feed, store) = setup(channel.clone());
        let id = RpcId::new();

        let mut first = two_way("reboot");
        first.id = Some(id);
        first.one_way = true;
        first.persisted = true;
        let call = dispatcher.submit(first).await.expect("submit");
        assert_eq!(
            call.outcome().await,
            RpcOutcome::Success { response: None }
        );
        let earlier = feed.recv().await.expect("resolution");

        let mut second = two_way("getValue");
        second.id = Some(id);
        second.persisted = true;
        second.timeout_ms = Some(5_000);
        let start = Instant::now();
        let call = dispatcher.submit(second).await.expect("resubmit");
        assert_eq!(dispatcher.timeouts().armed_count(), 1);

        // Resolution of the first call processed after the id was reused
        dispatcher.on_resolved(earlier).await;
        assert_eq!(dispatcher.timeouts().armed_count(), 1);
        assert!(dispatcher.registry().is_pending(id));
        assert!(matches!(
            stored_status(&store, id).await,
            Some(RpcStatus::Queued | RpcStatus::Sent)
        ));

        assert_eq!(call.outcome().await, RpcOutcome::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn test_cancelled_call_is_withdrawn_from_channel() {
        let channel = MockChannel::scripted(vec![Ok(DispatchAck::Queued)]);
        let (dispatcher, mut feed, _store) = setup(channel.clone());

        let call = dispatcher.submit(two_way("getValue")).await.expect("submit");
        let id = call.id();
        until(|| channel.attempts() == 1).await;

        assert!(dispatcher.cancel(id));
        dispatcher.on_resolved(feed.recv().await.expect("resolution")).await;
        assert_eq!(channel.withdrawn(), vec![id]);
        assert_eq!(call.outcome().await, RpcOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_reply_from_other_device_ignored() {
        let channel = MockChannel::scripted(vec![]);
        let (dispatcher, _feed, _store) = setup(channel.clone());

        let call = dispatcher.submit(two_way("getValue")).await.expect("submit");
        let id = call.id();
        until(|| channel.attempts() == 1).await;

        dispatcher
            .handle_event(ChannelEvent::Response {
                id,
                device_id: "edge-999".into(),
                response: Some(r#"{"value":1}"#.into()),
                error: None,
            })
            .await;
        assert!(dispatcher.registry().is_pending(id));

        dispatcher
            .handle_event(ChannelEvent::Response {
                id,
                device_id: "edge-001".into(),
                response: Some(r#"{"value":2}"#.into()),
                error: None,
            })
            .await;
        assert_eq!(
            call.outcome().await,
            RpcOutcome::Success {
                response: Some(r#"{"value":2}"#.into())
            }
        );
    }
}
