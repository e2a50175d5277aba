use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::queue::{DEFAULT_ALARM_STRIDE, DEFAULT_CAPACITY};

// =============================================================================
// File config (figment-deserialized from defaults / agent-link.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   agent-link.toml:  [queue]
//                     capacity = 500
//
//   env var:          LINK_QUEUE__CAPACITY=500   (double underscore = nesting)
//
//   (single underscore stays within field names: LINK_RETRY__SEND_RETRIES=5)

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "agent-link.toml";

/// Which side of the connection this process plays.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Listen for one inbound peer
    #[default]
    Hosting,
    /// Dial out to an external server
    Connecting,
}

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub hosting: HostingFileConfig,
    #[serde(default)]
    pub connecting: ConnectingFileConfig,
    #[serde(default)]
    pub queue: QueueFileConfig,
    #[serde(default)]
    pub retry: RetryFileConfig,
    #[serde(default)]
    pub socket: SocketFileConfig,
}

/// Listening endpoint (lives under `[hosting]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostingFileConfig {
    #[serde(default = "default_bind_host")]
    pub host: String,
    #[serde(default = "default_bind_port")]
    pub port: u16,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
}

impl Default for HostingFileConfig {
    fn default() -> Self {
        Self {
            host: default_bind_host(),
            port: default_bind_port(),
            ping_interval_secs: default_ping_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
        }
    }
}

/// Remote endpoint (lives under `[connecting]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectingFileConfig {
    #[serde(default = "default_connect_host")]
    pub host: String,
    /// Appended to `host` when set.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_simulation_id")]
    pub simulation_id: String,
    /// Resume cursor sent to the server; the default asks for new messages only.
    #[serde(default = "default_read_index")]
    pub read_index: u64,
}

impl Default for ConnectingFileConfig {
    fn default() -> Self {
        Self {
            host: default_connect_host(),
            port: None,
            path: default_path(),
            simulation_id: default_simulation_id(),
            read_index: default_read_index(),
        }
    }
}

/// Queue bounds (lives under `[queue]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueFileConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_alarm_stride")]
    pub alarm_stride: usize,
}

impl Default for QueueFileConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            alarm_stride: default_alarm_stride(),
        }
    }
}

/// Reconnect and send-retry policy (lives under `[retry]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryFileConfig {
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for RetryFileConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            send_retries: default_send_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Socket tuning (lives under `[socket]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SocketFileConfig {
    #[serde(default = "default_buffer_bytes")]
    pub recv_buffer_bytes: u32,
    #[serde(default = "default_buffer_bytes")]
    pub send_buffer_bytes: u32,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for SocketFileConfig {
    fn default() -> Self {
        Self {
            recv_buffer_bytes: default_buffer_bytes(),
            send_buffer_bytes: default_buffer_bytes(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}
fn default_bind_port() -> u16 {
    8765
}
fn default_ping_interval_secs() -> u64 {
    180
}
fn default_ping_timeout_secs() -> u64 {
    30
}
fn default_connect_host() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_path() -> String {
    "agent-observations".to_string()
}
fn default_simulation_id() -> String {
    "01234".to_string()
}
fn default_read_index() -> u64 {
    1_000_000
}
fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}
fn default_alarm_stride() -> usize {
    DEFAULT_ALARM_STRIDE
}
fn default_max_reconnect_attempts() -> u32 {
    3
}
fn default_reconnect_delay_ms() -> u64 {
    5000
}
fn default_send_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    50
}
fn default_buffer_bytes() -> u32 {
    5 * 1024 * 1024
}
fn default_poll_timeout_ms() -> u64 {
    3000
}

/// Build a figment that layers: defaults → config file → LINK_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `LINK_ROLE=connecting`          →  `role = "connecting"`
///   `LINK_QUEUE__CAPACITY=500`      →  `queue.capacity = 500`
pub fn load_config(config_file: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("LINK_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used by the transports)
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum frames held per direction
    pub capacity: usize,
    /// Spacing of overflow alarm checkpoints
    pub alarm_stride: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from_file(&QueueFileConfig::default())
    }
}

impl QueueConfig {
    pub fn from_file(fc: &QueueFileConfig) -> Self {
        Self {
            capacity: fc.capacity,
            alarm_stride: fc.alarm_stride,
        }
    }
}

/// Hosting role configuration (runtime view).
#[derive(Clone, Debug)]
pub struct HostingConfig {
    pub host: String,
    /// 0 picks an ephemeral port
    pub port: u16,
    pub queue: QueueConfig,
    /// Zero disables keepalive pings
    pub ping_interval: Duration,
    /// How long a pinged peer may stay silent before it is considered dead
    pub ping_timeout: Duration,
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

impl HostingConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            host: fc.hosting.host.clone(),
            port: fc.hosting.port,
            queue: QueueConfig::from_file(&fc.queue),
            ping_interval: Duration::from_secs(fc.hosting.ping_interval_secs),
            ping_timeout: Duration::from_secs(fc.hosting.ping_timeout_secs),
        }
    }
}

/// Connecting role configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ConnectingConfig {
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub simulation_id: String,
    pub read_index: u64,
    pub queue: QueueConfig,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub send_retries: u32,
    pub retry_backoff: Duration,
    /// Upper bound on one read wait, so shutdown is noticed
    pub poll_timeout: Duration,
    pub recv_buffer_bytes: u32,
    pub send_buffer_bytes: u32,
}

impl Default for ConnectingConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

impl ConnectingConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            host: fc.connecting.host.clone(),
            port: fc.connecting.port,
            path: fc.connecting.path.clone(),
            simulation_id: fc.connecting.simulation_id.clone(),
            read_index: fc.connecting.read_index,
            queue: QueueConfig::from_file(&fc.queue),
            max_reconnect_attempts: fc.retry.max_reconnect_attempts,
            reconnect_delay: Duration::from_millis(fc.retry.reconnect_delay_ms),
            send_retries: fc.retry.send_retries.max(1),
            retry_backoff: Duration::from_millis(fc.retry.retry_backoff_ms),
            poll_timeout: Duration::from_millis(fc.socket.poll_timeout_ms.max(1)),
            recv_buffer_bytes: fc.socket.recv_buffer_bytes,
            send_buffer_bytes: fc.socket.send_buffer_bytes,
        }
    }

    /// `ws://<host>[:<port>]/<path>?simulation_id=<id>&read_index=<cursor>`
    ///
    /// Path segments and the simulation id are percent-encoded.
    pub fn endpoint_url(&self) -> String {
        let authority = match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        };
        let path = self
            .path
            .trim_start_matches('/')
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "ws://{}/{}?simulation_id={}&read_index={}",
            authority,
            path,
            urlencoding::encode(&self.simulation_id),
            self.read_index
        )
    }
}

/// Everything needed to build either role.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    pub role: Role,
    pub hosting: HostingConfig,
    pub connecting: ConnectingConfig,
}

impl LinkConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            role: fc.role,
            hosting: HostingConfig::from_file(fc),
            connecting: ConnectingConfig::from_file(fc),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}
