use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::connection_manager::OverflowPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub shutdown: ShutdownSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    /// Outbound frames buffered per connection before the overflow policy kicks in
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// Dropped frames after which a connection is force-closed (0 = never)
    #[serde(default = "default_overflow_close_threshold")]
    pub overflow_close_threshold: u64,
    /// Inbound messages waiting for the dispatch task
    #[serde(default = "default_dispatch_buffer")]
    pub dispatch_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Largest inbound payload accepted, in bytes
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Keepalive ping interval in seconds (0 = disabled)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Close a connection after this many idle seconds (0 = disabled)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownSettings {
    /// Seconds to wait for connections to flush and close
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: u64,
    /// How long a session waits for its second I/O loop after the first exits
    #[serde(default = "default_loop_exit_timeout_ms")]
    pub loop_exit_timeout_ms: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_queue_capacity() -> usize {
    64
}

fn default_overflow_close_threshold() -> u64 {
    256
}

fn default_dispatch_buffer() -> usize {
    1024
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_loop_exit_timeout_ms() -> u64 {
    2000
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // PLANTHUB__SERVER__PORT, PLANTHUB__BROADCAST__QUEUE_CAPACITY, ...
            .add_source(
                Environment::with_prefix("PLANTHUB")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            broadcast: BroadcastConfig::default(),
            websocket: WebSocketConfig::default(),
            shutdown: ShutdownSettings::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            overflow_policy: OverflowPolicy::default(),
            overflow_close_threshold: default_overflow_close_threshold(),
            dispatch_buffer: default_dispatch_buffer(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            heartbeat_interval: default_heartbeat_interval(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl WebSocketConfig {
    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_interval > 0).then(|| Duration::from_secs(self.heartbeat_interval))
    }

    pub fn idle_limit(&self) -> Option<Duration> {
        (self.idle_timeout > 0).then(|| Duration::from_secs(self.idle_timeout))
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
            loop_exit_timeout_ms: default_loop_exit_timeout_ms(),
        }
    }
}

impl ShutdownSettings {
    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }

    pub fn loop_exit(&self) -> Duration {
        Duration::from_millis(self.loop_exit_timeout_ms)
    }
}
