//! Persisted RPC Lifecycle
//!
//! Defines the audit status of a persisted call and which status changes are valid.
//! Progress only moves forward; once a terminal status is reached it never changes.

use crate::RpcOutcome;
use serde::{Deserialize, Serialize};

/// Audit status of a persisted RPC call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcStatus {
    /// Registered, not yet handed to a device connection
    Queued,
    /// Written to a live device connection
    Sent,
    /// Device acknowledged receipt
    Delivered,
    /// Device replied with application data (or a one-way call was sent)
    Successful,
    /// No reply before the expiration time
    Timeout,
    /// Device error or device unreachable
    Failed,
    /// Abandoned by the caller or by shutdown
    Cancelled,
}

/// Result of a status change attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and the status changed
    Success(RpcStatus),
    /// Transition was invalid from the current status
    Invalid { from: RpcStatus, to: RpcStatus },
}

impl RpcStatus {
    /// Terminal status recorded for a resolved call
    pub fn from_outcome(outcome: &RpcOutcome) -> Self {
        match outcome {
            RpcOutcome::Success { .. } => RpcStatus::Successful,
            RpcOutcome::Timeout => RpcStatus::Timeout,
            RpcOutcome::DeviceError { .. } | RpcOutcome::NoActiveConnection => RpcStatus::Failed,
            RpcOutcome::Cancelled => RpcStatus::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RpcStatus::Successful | RpcStatus::Timeout | RpcStatus::Failed | RpcStatus::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            RpcStatus::Queued => 0,
            RpcStatus::Sent => 1,
            RpcStatus::Delivered => 2,
            _ => 3,
        }
    }

    /// Check whether moving to `to` is a forward step
    pub fn can_advance_to(&self, to: RpcStatus) -> bool {
        !self.is_terminal() && to.rank() > self.rank()
    }

    /// Move to `to` if valid, leaving the status untouched otherwise
    pub fn advance(&mut self, to: RpcStatus) -> TransitionResult {
        if self.can_advance_to(to) {
            *self = to;
            TransitionResult::Success(to)
        } else {
            TransitionResult::Invalid { from: *self, to }
        }
    }
}
