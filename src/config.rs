use crate::utils::SecretValue;
use anyhow::Context;
use config::{Config, ConfigError, File, FileFormat};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use std::{error::Error, fmt};

pub const SYSTEM_CONFIG: &str = "system_config";
pub const UART_CONFIG: &str = "uart_config";
pub const MQTT_CONFIG: &str = "mqtt_private_cloud_config";
pub const SOCKET_CONFIG: &str = "socket_private_cloud_config";
pub const READINESS_CONFIG: &str = "network_config";

#[derive(Debug)]
pub enum SettingsError {
    /// The dot path does not resolve to a value.
    KeyNotFound(String),
    /// The value exists but does not fit the requested type.
    Invalid { key: String, source: ConfigError },
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::KeyNotFound(key) => write!(f, "config key not found: {key}"),
            SettingsError::Invalid { key, source } => write!(f, "invalid config value at {key}: {source}"),
        }
    }
}

impl Error for SettingsError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SettingsError::Invalid { source, .. } => Some(source),
            SettingsError::KeyNotFound(_) => None,
        }
    }
}

/// Read-only device configuration with dot-path lookup
/// (`"system_config.cloud"`).
///
/// Built once at startup and handed down as typed snapshots; nothing in the
/// bridge mutates it.
#[derive(Debug, Clone)]
pub struct Settings {
    inner: Config,
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let inner = Config::builder()
            .add_source(File::from(path.to_path_buf()))
            .build()
            .with_context(|| format!("failed to read device config from {}", path.display()))?;
        Ok(Self { inner })
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let inner = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Json))
            .build()
            .context("failed to parse device config json")?;
        Ok(Self { inner })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, SettingsError> {
        self.inner.get::<T>(key).map_err(|err| match err {
            ConfigError::NotFound(_) => SettingsError::KeyNotFound(key.to_string()),
            source => SettingsError::Invalid {
                key: key.to_string(),
                source,
            },
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        !matches!(self.inner.get::<config::Value>(key), Err(ConfigError::NotFound(_)))
    }

    pub fn system(&self) -> Result<SystemConfig, SettingsError> {
        self.get(SYSTEM_CONFIG)
    }

    pub fn uart(&self) -> Result<UartConfig, SettingsError> {
        self.get(UART_CONFIG)
    }

    pub fn mqtt(&self) -> Result<MqttConfig, SettingsError> {
        self.get(MQTT_CONFIG)
    }

    pub fn socket(&self) -> Result<SocketConfig, SettingsError> {
        self.get(SOCKET_CONFIG)
    }

    /// `None` when the section is absent.
    pub fn readiness(&self) -> Result<Option<ReadinessConfig>, SettingsError> {
        match self.get(READINESS_CONFIG) {
            Ok(cfg) => Ok(Some(cfg)),
            Err(SettingsError::KeyNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudKind {
    Mqtt,
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemConfig {
    pub cloud: CloudKind,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// File touched on every heartbeat, for an external watchdog.
    #[serde(default)]
    pub heartbeat_file: Option<String>,
}

impl SystemConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UartConfig {
    pub port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    #[serde(default = "default_bytesize")]
    pub bytesize: u8,
    /// 0 none, 1 even, 2 odd.
    #[serde(default)]
    pub parity: u8,
    #[serde(default = "default_stopbits")]
    pub stopbits: u8,
    /// 0 none, 1 hardware, 2 software.
    #[serde(default)]
    pub flowctl: u8,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MqttConfig {
    pub client_id: String,
    pub server: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<SecretValue>,
    /// Seconds; 0 disables keep-alive pings.
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default)]
    pub qos: u8,
    /// Topics subscribed on every connect, by logical key.
    #[serde(default)]
    pub subscribe: BTreeMap<String, String>,
    /// Publish topics by logical key; the uplink uses `"up"`.
    #[serde(default)]
    pub publish: BTreeMap<String, String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SocketProtocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SocketConfig {
    pub domain: String,
    pub port: u16,
    /// Connect and read timeout in seconds; 0 disables the read timeout.
    #[serde(default = "default_socket_timeout")]
    pub timeout: u64,
    /// TCP keep-alive idle time in seconds.
    #[serde(default)]
    pub keep_alive: Option<u64>,
    #[serde(default)]
    pub protocol: SocketProtocol,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadinessConfig {
    /// `host:port` probed with a TCP connect.
    pub probe: String,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_probe_interval_secs")]
    pub retry_interval_secs: u64,
}

fn default_reconnect_delay_secs() -> u64 {
    10
}
fn default_inbound_capacity() -> usize {
    crate::sync::DEFAULT_QUEUE_CAPACITY
}
fn default_heartbeat_interval_ms() -> u64 {
    3000
}
fn default_baudrate() -> u32 {
    115_200
}
fn default_bytesize() -> u8 {
    8
}
fn default_stopbits() -> u8 {
    1
}
fn default_read_timeout_ms() -> u64 {
    100
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_keepalive() -> u16 {
    60
}
fn default_true() -> bool {
    true
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_socket_timeout() -> u64 {
    5
}
fn default_probe_timeout_secs() -> u64 {
    30
}
fn default_probe_interval_secs() -> u64 {
    1
}
