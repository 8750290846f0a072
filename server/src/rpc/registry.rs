//! Correlation registry: request id -> pending call
//!
//! The registry is the single place where a call moves from unresolved to resolved.
//! Device replies, the timeout scheduler, cancellation and shutdown all race through
//! [`CorrelationRegistry::resolve`]; the first one wins and every later attempt is
//! reported as stale.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use devrpc_shared::{RpcId, RpcOutcome, RpcRequest};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Registration failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("request id {0} is already pending")]
    DuplicateId(RpcId),

    #[error("registry is closed")]
    Closed,
}

/// Emitted once per winning resolution
#[derive(Debug, Clone)]
pub struct Resolution {
    pub request: Arc<RpcRequest>,
    pub outcome: RpcOutcome,
}

/// Registry entry for one dispatched call
struct PendingCall {
    request: Arc<RpcRequest>,
    /// The command reached a device connection
    sent: bool,
    outcome: Option<RpcOutcome>,
    waiter: Option<oneshot::Sender<RpcOutcome>>,
    resolved_at: Option<Instant>,
}

impl PendingCall {
    fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Handle the submitter uses to await the outcome of its call
#[derive(Debug)]
pub struct PendingCallHandle {
    request: Arc<RpcRequest>,
    rx: oneshot::Receiver<RpcOutcome>,
}

impl PendingCallHandle {
    pub fn id(&self) -> RpcId {
        self.request.id
    }

    pub fn request(&self) -> &Arc<RpcRequest> {
        &self.request
    }
}

/// Concurrent table of pending calls
pub struct CorrelationRegistry {
    entries: DashMap<RpcId, PendingCall>,
    closed: AtomicBool,
    resolutions: mpsc::UnboundedSender<Resolution>,
}

impl CorrelationRegistry {
    /// Create a registry and the feed that receives every winning resolution
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Resolution>) {
        let (resolutions, feed) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            entries: DashMap::new(),
            closed: AtomicBool::new(false),
            resolutions,
        });
        (registry, feed)
    }

    /// Insert a pending call for `request`
    ///
    /// Fails with [`RegistryError::DuplicateId`] while an unresolved entry with the same
    /// id exists. A resolved entry still inside its grace period is replaced.
    pub fn register(&self, request: RpcRequest) -> Result<PendingCallHandle, RegistryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }

        let id = request.id;
        let request = Arc::new(request);
        let (tx, rx) = oneshot::channel();
        let call = PendingCall {
            request: request.clone(),
            sent: false,
            outcome: None,
            waiter: Some(tx),
            resolved_at: None,
        };

        match self.entries.entry(id) {
            Entry::Occupied(mut existing) => {
                if !existing.get().is_resolved() {
                    return Err(RegistryError::DuplicateId(id));
                }
                existing.insert(call);
            }
            Entry::Vacant(slot) => {
                slot.insert(call);
            }
        }

        // close() may have drained the table between the check above and the insert
        if self.closed.load(Ordering::Acquire) {
            self.resolve(id, RpcOutcome::Cancelled);
        }

        debug!(
            "Registered call {} ({} -> {}, one_way={})",
            id, request.method, request.device_id, request.one_way
        );

        Ok(PendingCallHandle { request, rx })
    }

    /// Attempt the unresolved -> resolved transition for `id`
    ///
    /// Returns `true` only for the caller that performed the transition.
    pub fn resolve(&self, id: RpcId, outcome: RpcOutcome) -> bool {
        self.resolve_with(id, None, |_| outcome)
    }

    /// Resolve the call registered for exactly `request`
    ///
    /// Loses if the id has since been registered again by another request.
    pub fn resolve_call(&self, request: &Arc<RpcRequest>, outcome: RpcOutcome) -> bool {
        self.resolve_with(request.id, Some(request), |_| outcome)
    }

    /// Resolve `request` because its deadline passed
    ///
    /// The outcome is `Timeout` if the command reached the device and
    /// `NoActiveConnection` if it never left the channel's queue.
    pub fn resolve_expired(&self, request: &Arc<RpcRequest>) -> bool {
        self.resolve_with(request.id, Some(request), |call| {
            if call.sent {
                RpcOutcome::Timeout
            } else {
                RpcOutcome::NoActiveConnection
            }
        })
    }

    /// The at-most-once gate: the outcome is chosen and stored under the entry lock
    fn resolve_with<F>(&self, id: RpcId, expected: Option<&Arc<RpcRequest>>, outcome_for: F) -> bool
    where
        F: FnOnce(&PendingCall) -> RpcOutcome,
    {
        let resolution = {
            let Some(mut call) = self.entries.get_mut(&id) else {
                warn!("Resolution for unknown call {} discarded", id);
                return false;
            };

            if let Some(expected) = expected {
                if !Arc::ptr_eq(&call.request, expected) {
                    debug!("Resolution for superseded call {} discarded", id);
                    return false;
                }
            }

            if call.is_resolved() {
                debug!("Resolution for already resolved call {} discarded", id);
                return false;
            }

            let outcome = outcome_for(call.value());
            call.outcome = Some(outcome.clone());
            call.resolved_at = Some(Instant::now());
            if let Some(waiter) = call.waiter.take() {
                // Receiver gone means the submitter stopped waiting; the outcome still stands
                let _ = waiter.send(outcome.clone());
            }

            Resolution {
                request: call.request.clone(),
                outcome,
            }
        };

        debug!("Call {} resolved: {}", id, resolution.outcome);
        let _ = self.resolutions.send(resolution);
        true
    }

    /// Record that the command for `request` was written to a device connection
    ///
    /// Returns `false` if the call is unknown, superseded or already resolved.
    pub fn mark_sent(&self, request: &Arc<RpcRequest>) -> bool {
        match self.entries.get_mut(&request.id) {
            Some(mut call) if Arc::ptr_eq(&call.request, request) && !call.is_resolved() => {
                call.sent = true;
                true
            }
            _ => false,
        }
    }

    /// Wait until `handle`'s call is resolved and return the outcome
    ///
    /// With a `deadline`, the caller joins the race itself once it passes.
    pub async fn wait(&self, handle: PendingCallHandle, deadline: Option<Instant>) -> RpcOutcome {
        let PendingCallHandle { request, mut rx } = handle;

        if let Some(deadline) = deadline {
            match tokio::time::timeout_at(deadline, &mut rx).await {
                Ok(Ok(outcome)) => return outcome,
                Ok(Err(_)) => return self.orphaned(request.id),
                Err(_) => {
                    self.resolve_expired(&request);
                }
            }
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => self.orphaned(request.id),
        }
    }

    /// Outcome for a handle whose entry was evicted before resolution
    fn orphaned(&self, id: RpcId) -> RpcOutcome {
        self.outcome(id).unwrap_or(RpcOutcome::Cancelled)
    }

    /// Stored outcome of a resolved call still in the table
    pub fn outcome(&self, id: RpcId) -> Option<RpcOutcome> {
        self.entries.get(&id).and_then(|call| call.outcome.clone())
    }

    /// Request of a call still in the table
    pub fn request(&self, id: RpcId) -> Option<Arc<RpcRequest>> {
        self.entries.get(&id).map(|call| call.request.clone())
    }

    pub fn is_pending(&self, id: RpcId) -> bool {
        self.entries
            .get(&id)
            .map(|call| !call.is_resolved())
            .unwrap_or(false)
    }

    /// `request` is the call registered under its id and is still unresolved
    pub fn is_current(&self, request: &Arc<RpcRequest>) -> bool {
        self.entries
            .get(&request.id)
            .map(|call| Arc::ptr_eq(&call.request, request) && !call.is_resolved())
            .unwrap_or(false)
    }

    /// A newer call has been registered under `request`'s id
    pub fn is_superseded(&self, request: &Arc<RpcRequest>) -> bool {
        self.entries
            .get(&request.id)
            .map(|call| !Arc::ptr_eq(&call.request, request))
            .unwrap_or(false)
    }

    /// Remove the entry for `id`, resolved or not
    pub fn evict(&self, id: RpcId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Evict resolved entries older than `grace`, returning how many were removed
    pub fn sweep(&self, grace: Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, call| match call.resolved_at {
            Some(at) => now.duration_since(at) < grace,
            None => true,
        });
        before.saturating_sub(self.entries.len())
    }

    /// Number of unresolved calls
    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|call| !call.is_resolved())
            .count()
    }

    /// Number of entries, resolved ones in their grace period included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reject new registrations and cancel everything still pending
    ///
    /// Returns the number of calls this drain resolved.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);

        let pending: Vec<RpcId> = self
            .entries
            .iter()
            .filter(|call| !call.is_resolved())
            .map(|call| *call.key())
            .collect();

        pending
            .into_iter()
            .filter(|id| self.resolve(*id, RpcOutcome::Cancelled))
            .count()
    }
}
