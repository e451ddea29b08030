//! Configuration for the MQTT engine
//!
//! Loaded from TOML. The `[mqtt]` table carries the connection options the
//! engine needs; `[reconnect]` tunes the backoff controller and
//! `subscriptions` lists the topics the CLI subscribes to after every
//! (re)connect.

use crate::protocol::topics::{validate_topic_filter, validate_topic_name, ValidationError};
use crate::transport::mqtt::health_monitor::{BackoffPolicy, KeepalivePolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 1883;

/// Top-level client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// Connection options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker host name or address
    pub server: String,
    /// 0 selects the standard port
    #[serde(default)]
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Environment variable whose value replaces `password` at load time
    pub password_env: Option<String>,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u32,
    /// Upper bound on the ping interval; 0 derives it from the keepalive alone
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// How long any single read, write or acknowledgment may stall
    #[serde(default = "default_response_time")]
    pub response_time_secs: u64,
    /// Total QoS 1 sends (first send included) before the publish fails
    #[serde(default = "default_max_publish_attempts")]
    pub max_publish_attempts: u32,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    /// Reset any stale broker session before the first unclean connect
    #[serde(default = "default_true")]
    pub clean_init: bool,
    /// Largest inbound remaining length accepted
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    pub last_will: Option<LastWillSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastWillSection {
    pub topic: String,
    pub message: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

/// Backoff tuning for the reconnection controller
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionConfig {
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
}

fn default_keepalive() -> u32 {
    60
}

fn default_ping_interval() -> u64 {
    20
}

fn default_response_time() -> u64 {
    10
}

fn default_max_publish_attempts() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

fn default_max_packet_size() -> usize {
    64 * 1024
}

fn default_base_delay() -> u64 {
    5
}

fn default_max_delay() -> u64 {
    300
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Keepalive of {0} seconds exceeds 65535")]
    InvalidKeepalive(u32),
    #[error("QoS {0} is not supported")]
    UnsupportedQoS(u8),
    #[error("Invalid topic '{topic}': {source}")]
    InvalidTopic {
        topic: String,
        #[source]
        source: ValidationError,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Configuration with every option at its default
    pub fn new(server: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            mqtt: MqttSection {
                server: server.into(),
                port: 0,
                client_id: client_id.into(),
                username: None,
                password: None,
                password_env: None,
                keepalive_secs: default_keepalive(),
                ping_interval_secs: default_ping_interval(),
                response_time_secs: default_response_time(),
                max_publish_attempts: default_max_publish_attempts(),
                clean_session: true,
                clean_init: true,
                max_packet_size: default_max_packet_size(),
                last_will: None,
            },
            reconnect: ReconnectSection::default(),
            subscriptions: Vec::new(),
        }
    }

    /// Load configuration from TOML file with environment variable resolution
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: ClientConfig = toml::from_str(content)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(name) = &self.mqtt.password_env {
            let password =
                std::env::var(name).map_err(|_| ConfigError::EnvVarNotFound(name.clone()))?;
            self.mqtt.password = Some(password);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt.validate()?;

        if self.reconnect.base_delay_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.base_delay_secs must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.max_delay_secs < self.reconnect.base_delay_secs {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_delay_secs must not be below base_delay_secs".to_string(),
            ));
        }

        for sub in &self.subscriptions {
            check_qos(sub.qos)?;
            validate_topic_filter(&sub.topic).map_err(|source| ConfigError::InvalidTopic {
                topic: sub.topic.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.reconnect.base_delay_secs),
            Duration::from_secs(self.reconnect.max_delay_secs),
        )
    }

    /// TOML rendering with the password masked
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        if shown.mqtt.password.is_some() {
            shown.mqtt.password = Some("***".to_string());
        }
        Ok(toml::to_string_pretty(&shown)?)
    }
}

impl MqttSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.server cannot be empty".to_string(),
            ));
        }
        self.keepalive()?;
        if self.response_time_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.response_time_secs must be greater than 0".to_string(),
            ));
        }
        if self.max_publish_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.max_publish_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(will) = &self.last_will {
            check_qos(will.qos)?;
            validate_topic_name(&will.topic).map_err(|source| ConfigError::InvalidTopic {
                topic: will.topic.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_PORT
        } else {
            self.port
        }
    }

    /// Keepalive as sent in CONNECT
    pub fn keepalive(&self) -> Result<u16, ConfigError> {
        u16::try_from(self.keepalive_secs)
            .map_err(|_| ConfigError::InvalidKeepalive(self.keepalive_secs))
    }

    pub fn ping_interval(&self) -> Result<Duration, ConfigError> {
        Ok(KeepalivePolicy::ping_interval(
            self.keepalive()?,
            self.ping_interval_secs,
        ))
    }

    pub fn response_time(&self) -> Duration {
        Duration::from_secs(self.response_time_secs)
    }
}

fn check_qos(qos: u8) -> Result<(), ConfigError> {
    match qos {
        0 | 1 => Ok(()),
        2 => Err(ConfigError::UnsupportedQoS(qos)),
        _ => Err(ConfigError::InvalidConfig(format!("QoS {qos} is out of range"))),
    }
}
