//! Method handlers

mod echo;
mod status;
mod values;

pub use echo::handle_echo;
pub use status::handle_get_status;
pub use values::{handle_get_value, handle_set_value};

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Context passed to method handlers
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub device_id: String,
    pub uptime: Duration,
    pub values: Arc<RwLock<HashMap<String, Value>>>,
}
