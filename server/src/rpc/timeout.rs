//! Deadline timers for pending calls

use super::registry::CorrelationRegistry;
use dashmap::DashMap;
use devrpc_shared::{RpcId, RpcRequest};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

struct Timer {
    generation: u64,
    request: Arc<RpcRequest>,
    task: AbortHandle,
}

/// Arms one deadline per call; on expiry the call is resolved through the registry
///
/// The scheduler never assumes it owns the resolution. A timer that fires after a
/// device reply is simply a losing resolver, so cancelling is only an optimisation.
pub struct TimeoutScheduler {
    registry: Arc<CorrelationRegistry>,
    timers: Arc<DashMap<RpcId, Timer>>,
    generation: AtomicU64,
}

impl TimeoutScheduler {
    pub fn new(registry: Arc<CorrelationRegistry>) -> Self {
        Self {
            registry,
            timers: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Schedule the expiry of `request` at `deadline`, replacing any timer armed for its id
    pub fn arm(&self, request: &Arc<RpcRequest>, deadline: Instant) {
        let id = request.id;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let registry = self.registry.clone();
        let timers = self.timers.clone();
        let expiring = request.clone();

        let handle = tokio::spawn(async move {
            sleep_until(deadline).await;
            timers.remove_if(&id, |_, timer| timer.generation == generation);
            if registry.resolve_expired(&expiring) {
                debug!("Call {} expired", id);
            }
        });

        let timer = Timer {
            generation,
            request: request.clone(),
            task: handle.abort_handle(),
        };
        if let Some(previous) = self.timers.insert(id, timer) {
            previous.task.abort();
        }

        // The task may have fired before its timer was inserted
        if handle.is_finished() {
            self.timers
                .remove_if(&id, |_, timer| timer.generation == generation);
        }
    }

    /// Disarm the timer for `id`, returning whether one was armed
    pub fn cancel(&self, id: RpcId) -> bool {
        match self.timers.remove(&id) {
            Some((_, timer)) => {
                timer.task.abort();
                true
            }
            None => false,
        }
    }

    /// Disarm the timer only if it was armed for exactly `request`
    ///
    /// A timer armed for a later request reusing the same id is left running.
    pub fn disarm(&self, request: &Arc<RpcRequest>) -> bool {
        match self
            .timers
            .remove_if(&request.id, |_, timer| Arc::ptr_eq(&timer.request, request))
        {
            Some((_, timer)) => {
                timer.task.abort();
                true
            }
            None => false,
        }
    }

    /// Disarm every timer
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<RpcId> = self.timers.iter().map(|timer| *timer.key()).collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::registry::PendingCallHandle;
    use devrpc_shared::{now_ms, RpcOutcome, RpcRequest};
    use std::time::Duration;

    fn register(registry: &CorrelationRegistry) -> PendingCallHandle {
        registry
            .register(RpcRequest {
                id: RpcId::new(),
                tenant_id: "tenant-a".into(),
                device_id: "edge-001".into(),
                one_way: false,
                method: "getValue".into(),
                params: "{}".into(),
                expiration_time: now_ms() + 5_000,
                persisted: false,
                retries: None,
                additional_info: None,
            })
            .expect("register")
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_at_deadline_not_before() {
        let (registry, _feed) = CorrelationRegistry::new();
        let scheduler = TimeoutScheduler::new(registry.clone());
        let handle = register(&registry);
        registry.mark_sent(handle.request());

        let start = Instant::now();
        scheduler.arm(handle.request(), start + Duration::from_millis(5_000));
        assert_eq!(scheduler.armed_count(), 1);

        let outcome = registry.wait(handle, None).await;
        assert_eq!(outcome, RpcOutcome::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(5_000));
        assert_eq!(scheduler.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsent_call_expires_as_no_connection() {
        let (registry, _feed) = CorrelationRegistry::new();
        let scheduler = TimeoutScheduler::new(registry.clone());
        let handle = register(&registry);

        scheduler.arm(handle.request(), Instant::now() + Duration::from_secs(1));
        assert_eq!(
            registry.wait(handle, None).await,
            RpcOutcome::NoActiveConnection
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let (registry, _feed) = CorrelationRegistry::new();
        let scheduler = TimeoutScheduler::new(registry.clone());
        let handle = register(&registry);

        scheduler.arm(handle.request(), Instant::now() + Duration::from_secs(1));
        assert!(scheduler.cancel(handle.id()));
        assert!(!scheduler.cancel(handle.id()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(registry.is_pending(handle.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_timer() {
        let (registry, _feed) = CorrelationRegistry::new();
        let scheduler = TimeoutScheduler::new(registry.clone());
        let handle = register(&registry);
        let start = Instant::now();

        scheduler.arm(handle.request(), start + Duration::from_secs(1));
        scheduler.arm(handle.request(), start + Duration::from_secs(3));
        assert_eq!(scheduler.armed_count(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(registry.is_pending(handle.id()));

        registry.wait(handle, None).await;
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_timer_is_a_losing_resolver() {
        let (registry, _feed) = CorrelationRegistry::new();
        let scheduler = TimeoutScheduler::new(registry.clone());
        let handle = register(&registry);
        let id = handle.id();

        scheduler.arm(handle.request(), Instant::now() + Duration::from_secs(1));
        let reply = RpcOutcome::Success {
            response: Some("{}".into()),
        };
        assert!(registry.resolve(id, reply.clone()));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.outcome(id), Some(reply.clone()));
        assert_eq!(registry.wait(handle, None).await, reply);
        assert_eq!(scheduler.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_leaves_timer_of_reused_id() {
        let (registry, _feed) = CorrelationRegistry::new();
        let scheduler = TimeoutScheduler::new(registry.clone());
        let first = register(&registry);
        let old = first.request().clone();
        scheduler.arm(&old, Instant::now() + Duration::from_secs(1));
        assert!(registry.resolve(old.id, RpcOutcome::Cancelled));

        let second = registry
            .register(RpcRequest::clone(&old))
            .expect("reuse after resolution");
        scheduler.arm(second.request(), Instant::now() + Duration::from_secs(2));

        assert!(!scheduler.disarm(&old));
        assert_eq!(scheduler.armed_count(), 1);

        assert_eq!(
            registry.wait(second, None).await,
            RpcOutcome::NoActiveConnection
        );
        assert_eq!(scheduler.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let (registry, _feed) = CorrelationRegistry::new();
        let scheduler = TimeoutScheduler::new(registry.clone());
        let a = register(&registry);
        let b = register(&registry);

        scheduler.arm(a.request(), Instant::now() + Duration::from_secs(1));
        scheduler.arm(b.request(), Instant::now() + Duration::from_secs(1));
        assert_eq!(scheduler.cancel_all(), 2);
        assert_eq!(scheduler.armed_count(), 0);
    }
}
