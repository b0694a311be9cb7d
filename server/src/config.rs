//! # Configuration
//!
//! Loaded from an optional `fwd-ws.toml` in the working directory and then
//! from `FWD__*` environment variables (e.g. `FWD__SERVER__PORT=9000`,
//! `FWD__PARTNER__PEERS__BOB=http://10.0.0.7:8090`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Top-level forwarder configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FwdConfig {
    /// Control listener settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Relay timeouts and buffering
    #[serde(default)]
    pub relay: RelayConfig,
    /// How partners are reached
    #[serde(default)]
    pub partner: PartnerConfig,
    /// Where the public state is persisted between runs. Nothing is
    /// persisted when unset.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to (default: 0.0.0.0)
    #[serde(default = "default_host")]
    pub host: String,
    /// Control API port (default: 8090)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Log level used when `RUST_LOG` is unset (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Dial attempts give up after this long (default: 10s)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Teardown waits this long per transition before dropping
    /// connections (default: 2s)
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    /// Frames buffered per connection and toward the partner (default: 256)
    #[serde(default = "default_buffer_frames")]
    pub buffer_frames: usize,
    /// First re-dial delay after the outbound connection drops (default: 5s)
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    /// Re-dial delay cap (default: 30s)
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Server dialed at startup when no state was restored
    #[serde(default)]
    pub connect_on_start: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PartnerConfig {
    /// This forwarder's own identity, sent with every forwarded frame
    #[serde(default = "default_node")]
    pub node: String,
    /// Partner identity → base URL of that partner's forwarder
    #[serde(default)]
    pub peers: HashMap<String, String>,
    /// HTTP timeout for a single delivery (default: 10s)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl FwdConfig {
    /// Load config from the optional config file and environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name("fwd-ws").required(false))
            .add_source(
                config::Environment::default()
                    .prefix("FWD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        cfg.try_deserialize()
    }
}

impl RelayConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

impl PartnerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            buffer_frames: default_buffer_frames(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            connect_on_start: None,
        }
    }
}

impl Default for PartnerConfig {
    fn default() -> Self {
        Self {
            node: default_node(),
            peers: HashMap::new(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8090
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_close_timeout_ms() -> u64 {
    2_000
}
fn default_buffer_frames() -> usize {
    256
}
fn default_reconnect_initial_ms() -> u64 {
    5_000
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_node() -> String {
    "local".to_string()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
