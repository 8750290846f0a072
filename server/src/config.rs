//! Server configuration
//!
//! Every section has a usable default, so an empty TOML file (or no file at all)
//! yields a working server.

use axum::http::StatusCode;
use devrpc_shared::timing;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address of the HTTP API
    pub http_addr: SocketAddr,
    /// Address devices connect to
    pub device_addr: SocketAddr,
    /// Tenant used when a caller does not send `x-tenant-id`
    pub default_tenant: String,
    pub rpc: RpcConfig,
    pub devices: DeviceConfig,
    pub status: StatusConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            device_addr: SocketAddr::from(([0, 0, 0, 0], 7070)),
            default_tenant: "default".into(),
            rpc: RpcConfig::default(),
            devices: DeviceConfig::default(),
            status: StatusConfig::default(),
        }
    }
}

/// Correlation core settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Floor applied to caller-requested timeouts
    pub min_timeout_ms: u64,
    /// Timeout used when the caller omits one
    pub default_timeout_ms: u64,
    /// Pause between two dispatch attempts of the same call
    pub dispatch_retry_delay_ms: u64,
    /// How long resolved calls stay in the registry
    pub resolved_grace_ms: u64,
    /// How often resolved calls past their grace period are evicted
    pub sweep_interval_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            min_timeout_ms: timing::MIN_TIMEOUT_MS,
            default_timeout_ms: timing::DEFAULT_TIMEOUT_MS,
            dispatch_retry_delay_ms: timing::DISPATCH_RETRY_DELAY_MS,
            resolved_grace_ms: timing::RESOLVED_GRACE_MS,
            sweep_interval_ms: 5_000,
        }
    }
}

impl RpcConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.dispatch_retry_delay_ms)
    }

    pub fn resolved_grace(&self) -> Duration {
        Duration::from_millis(self.resolved_grace_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Device link settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Drop a session when no heartbeat arrived for this long
    pub heartbeat_timeout_ms: u64,
    /// A new connection must send `Hello` within this window
    pub hello_timeout_ms: u64,
    /// Park commands for offline devices instead of failing the dispatch
    pub queue_while_offline: bool,
    /// How often dead sessions and expired queued commands are reaped
    pub reap_interval_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: timing::HEARTBEAT_TIMEOUT_MS,
            hello_timeout_ms: timing::HELLO_TIMEOUT_MS,
            queue_while_offline: true,
            reap_interval_ms: 1_000,
        }
    }
}

impl DeviceConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn hello_timeout(&self) -> Duration {
        Duration::from_millis(self.hello_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// HTTP status codes per API surface
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub v1: SurfaceStatus,
}

/// Caller-specified statuses for the non-success outcomes of one surface
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SurfaceStatus {
    pub timeout: u16,
    pub no_connection: u16,
}

impl Default for SurfaceStatus {
    fn default() -> Self {
        Self {
            timeout: StatusCode::REQUEST_TIMEOUT.as_u16(),
            no_connection: StatusCode::CONFLICT.as_u16(),
        }
    }
}

impl SurfaceStatus {
    pub fn timeout_status(&self) -> Result<StatusCode, ConfigError> {
        status_code("timeout", self.timeout)
    }

    pub fn no_connection_status(&self) -> Result<StatusCode, ConfigError> {
        status_code("no_connection", self.no_connection)
    }
}

fn status_code(name: &str, code: u16) -> Result<StatusCode, ConfigError> {
    StatusCode::from_u16(code)
        .map_err(|_| ConfigError::Invalid(format!("status.v1.{} is not an HTTP status: {}", name, code)))
}

impl ServerConfig {
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("rpc.min_timeout_ms", self.rpc.min_timeout_ms),
            ("rpc.default_timeout_ms", self.rpc.default_timeout_ms),
            ("rpc.sweep_interval_ms", self.rpc.sweep_interval_ms),
            ("devices.heartbeat_timeout_ms", self.devices.heartbeat_timeout_ms),
            ("devices.hello_timeout_ms", self.devices.hello_timeout_ms),
            ("devices.reap_interval_ms", self.devices.reap_interval_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
            }
        }

        if self.default_tenant.trim().is_empty() {
            return Err(ConfigError::Invalid("default_tenant must not be empty".into()));
        }

        self.status.v1.timeout_status()?;
        self.status.v1.no_connection_status()?;
        Ok(())
    }

    /// Sample configuration printed by `--example-config`
    pub fn example_toml() -> &'static str {
        r#"http_addr = "0.0.0.0:8080"
device_addr = "0.0.0.0:7070"
default_tenant = "default"

[rpc]
min_timeout_ms = 5000
default_timeout_ms = 10000
dispatch_retry_delay_ms = 100
resolved_grace_ms = 30000
sweep_interval_ms = 5000

[devices]
heartbeat_timeout_ms = 15000
hello_timeout_ms = 5000
queue_while_offline = true
reap_interval_ms = 1000

[status.v1]
timeout = 408
no_connection = 409
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rpc.min_timeout_ms, 5_000);
        assert_eq!(config.rpc.default_timeout_ms, 10_000);
    }

    #[test]
    fn test_example_config_parses() {
        let config = ServerConfig::from_toml(ServerConfig::example_toml()).expect("parse");
        assert_eq!(config.http_addr.port(), 8080);
        assert_eq!(config.device_addr.port(), 7070);
        assert!(config.devices.queue_while_offline);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let input = r#"
[rpc]
min_timeout_ms = 250

[status.v1]
timeout = 504
"#;
        let config = ServerConfig::from_toml(input).expect("parse");
        assert_eq!(config.rpc.min_timeout_ms, 250);
        assert_eq!(config.rpc.default_timeout_ms, 10_000);
        assert_eq!(
            config.status.v1.timeout_status().expect("status"),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            config.status.v1.no_connection_status().expect("status"),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_invalid_status_rejected() {
        let input = r#"
[status.v1]
no_connection = 42
"#;
        assert!(matches!(
            ServerConfig::from_toml(input),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let input = r#"
[rpc]
default_timeout_ms = 0
"#;
        assert!(matches!(
            ServerConfig::from_toml(input),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = ServerConfig::from_path("/definitely/not/here.toml");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
