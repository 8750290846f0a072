//! RPC correlation core
//!
//! This module handles:
//! - Registering in-flight calls and resolving each exactly once
//! - Arming a deadline timer per call
//! - Dispatching commands to devices with retries
//! - Mapping resolved outcomes to caller-facing results
//! - Recording persisted calls in the audit store

mod channel;
mod classifier;
mod dispatcher;
mod registry;
mod store;
mod timeout;

pub use channel::{ChannelEvent, DeviceChannel, DispatchAck, DispatchError};
pub use classifier::{Classified, OutcomeClassifier};
pub use dispatcher::{RpcCall, RpcDispatcher, SubmitError, SubmitRequest};
pub use registry::{CorrelationRegistry, PendingCallHandle, RegistryError, Resolution};
pub use store::{InMemoryRpcStore, RpcRecord, RpcStore, StoreError};
pub use timeout::TimeoutScheduler;
