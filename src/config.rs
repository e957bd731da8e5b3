//! Configuration system for the MQTT relay
//!
//! The relay reads a single TOML file. Every section is optional and falls
//! back to the defaults the dashboard has always used (MQTT 3.1.1, clean
//! session, 60s keepalive, 5s reconnect period, 30s WebSocket liveness).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    /// Broker connections registered at startup
    #[serde(default)]
    pub connections: Vec<ConnectionSeed>,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// Broker link tuning shared by every session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Upper bound on the network handshake, CONNACK included
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Upper bound on SUBACK/UNSUBACK/PUBACK/PUBCOMP waits
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Delay between automatic reconnect attempts after a drop
    #[serde(default = "default_reconnect_period")]
    pub reconnect_period_secs: u64,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// Capacity of the rumqttc request channel
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            ack_timeout_secs: default_ack_timeout(),
            keep_alive_secs: default_keep_alive(),
            reconnect_period_secs: default_reconnect_period(),
            clean_session: default_clean_session(),
            request_capacity: default_request_capacity(),
        }
    }
}

impl MqttSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_period(&self) -> Duration {
        Duration::from_secs(self.reconnect_period_secs)
    }
}

/// Browser-facing WebSocket settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySection {
    /// Ping interval; a channel that leaves one ping unanswered is dropped
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// How long shutdown waits for channels to flush their close frames
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    /// Events queued per channel before a slow browser is dropped
    #[serde(default = "default_observer_queue")]
    pub observer_queue: usize,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            max_frame_bytes: default_max_frame_bytes(),
            shutdown_grace_secs: default_shutdown_grace(),
            observer_queue: default_observer_queue(),
        }
    }
}

impl GatewaySection {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// A broker connection to register at startup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSeed {
    pub name: String,
    /// Broker host name, without scheme or port
    pub broker_url: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub client_id: String,
    pub username: Option<String>,
    /// Environment variable holding the broker password
    pub password_env: Option<String>,
    #[serde(default)]
    pub use_auth: bool,
    #[serde(default = "default_user_id")]
    pub user_id: i64,
    #[serde(default)]
    pub topics: Vec<TopicSeed>,
}

impl ConnectionSeed {
    /// Resolve the password from the environment, if one is configured
    pub fn password(&self) -> Option<String> {
        self.password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }
}

/// A topic persisted as subscribed for a seeded connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicSeed {
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_ack_timeout() -> u64 {
    10
}

fn default_keep_alive() -> u64 {
    60
}

fn default_reconnect_period() -> u64 {
    5
}

fn default_clean_session() -> bool {
    true
}

fn default_request_capacity() -> usize {
    10
}

fn default_ping_interval() -> u64 {
    30
}

fn default_max_frame_bytes() -> usize {
    64 * 1024
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_observer_queue() -> usize {
    256
}

fn default_protocol() -> String {
    "mqtt".to_string()
}

fn default_user_id() -> i64 {
    1
}

/// Schemes a broker connection may use
pub const SUPPORTED_SCHEMES: &[&str] = &["mqtt", "tcp", "mqtts", "ssl", "ws", "wss"];

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Unsupported broker scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RelayConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.connect_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.mqtt.ack_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.ack_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.mqtt.request_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.request_capacity must be greater than zero".to_string(),
            ));
        }
        if self.gateway.ping_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "gateway.ping_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.gateway.observer_queue == 0 {
            return Err(ConfigError::InvalidConfig(
                "gateway.observer_queue must be greater than zero".to_string(),
            ));
        }

        for seed in &self.connections {
            validate_scheme(&seed.protocol)?;
            if seed.broker_url.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "connection '{}' has an empty broker_url",
                    seed.name
                )));
            }
            if seed.port == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "connection '{}' has port 0",
                    seed.name
                )));
            }
            for topic in &seed.topics {
                if topic.topic.trim().is_empty() || topic.qos > 2 {
                    return Err(ConfigError::InvalidConfig(format!(
                        "connection '{}' has an invalid topic entry '{}' (qos {})",
                        seed.name, topic.topic, topic.qos
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Check a broker scheme against the supported set
pub fn validate_scheme(scheme: &str) -> Result<(), ConfigError> {
    if SUPPORTED_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()) {
        Ok(())
    } else {
        Err(ConfigError::UnsupportedScheme(scheme.to_string()))
    }
}
