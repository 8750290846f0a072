//! Session management for connected devices
//!
//! This module handles:
//! - Accepting device connections and the Hello handshake
//! - Tracking one live session per device
//! - Parking commands for offline devices and flushing them on reconnect
//! - Heartbeat monitoring and dead session reaping

mod connection;
mod listener;
mod manager;

pub use connection::{DeviceSession, SessionHandle};
pub use listener::serve;
pub use manager::SessionManager;
