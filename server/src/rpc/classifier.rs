//! Outcome classification: resolved outcome -> caller-facing result
//!
//! The classifier is generic over the status type so that the HTTP boundary can use
//! `StatusCode` while other callers plug in their own result enum.

use devrpc_shared::{DeviceErrorKind, RpcOutcome};
use std::collections::HashMap;

/// Result shape handed back to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified<S> {
    pub status: S,
    /// Device payload, present only for successful calls that returned one
    pub payload: Option<String>,
    /// The device succeeded but its payload was not valid JSON
    pub format_error: bool,
}

/// Exhaustive mapping from [`RpcOutcome`] to a caller status
#[derive(Debug, Clone)]
pub struct OutcomeClassifier<S> {
    pub ok: S,
    pub timeout: S,
    pub no_connection: S,
    /// Success payload that is not valid JSON
    pub format_error: S,
    pub cancelled: S,
    /// Status per device error kind; unknown kinds fall back to `timeout`
    pub device_errors: HashMap<DeviceErrorKind, S>,
}

impl<S: Copy> OutcomeClassifier<S> {
    pub fn new(ok: S, timeout: S, no_connection: S, format_error: S, cancelled: S) -> Self {
        Self {
            ok,
            timeout,
            no_connection,
            format_error,
            cancelled,
            device_errors: HashMap::new(),
        }
    }

    pub fn with_device_error(mut self, kind: DeviceErrorKind, status: S) -> Self {
        self.device_errors.insert(kind, status);
        self
    }

    pub fn classify(&self, outcome: &RpcOutcome) -> Classified<S> {
        match outcome {
            RpcOutcome::Success { response } => match response.as_deref() {
                None => self.status_only(self.ok),
                Some(payload) if payload.trim().is_empty() => self.status_only(self.ok),
                Some(payload) => {
                    if serde_json::from_str::<serde_json::Value>(payload).is_ok() {
                        Classified {
                            status: self.ok,
                            payload: Some(payload.to_string()),
                            format_error: false,
                        }
                    } else {
                        Classified {
                            status: self.format_error,
                            payload: None,
                            format_error: true,
                        }
                    }
                }
            },
            RpcOutcome::DeviceError { kind } => self.status_only(
                self.device_errors
                    .get(kind)
                    .copied()
                    .unwrap_or(self.timeout),
            ),
            RpcOutcome::Timeout => self.status_only(self.timeout),
            RpcOutcome::NoActiveConnection => self.status_only(self.no_connection),
            RpcOutcome::Cancelled => self.status_only(self.cancelled),
        }
    }

    fn status_only(&self, status: S) -> Classified<S> {
        Classified {
            status,
            payload: None,
            format_error: false,
        }
    }
}
