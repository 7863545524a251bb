//! TOML configuration for the consumer pipeline
//!
//! Every tunable the pipeline exposes lives here: broker endpoint and
//! credentials, subscription list, inbox sizing, reconnect cadence and
//! dispatch behavior. Credentials are referenced by environment variable
//! name and resolved at startup, never stored in the file.

use crate::message::{QosLevel, TopicSubscription};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerConfig {
    pub mqtt: MqttSection,
    /// Topic filters to subscribe to on every (re)connect
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionEntry>,
    #[serde(default)]
    pub inbox: InboxSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
}

/// MQTT broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL with scheme and optional port (mqtt:// or mqtts://)
    pub broker_url: String,
    /// Stable client identifier; generated once at startup when absent
    pub client_id: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Keep-alive interval in seconds (default: 60)
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// CONNACK wait budget in milliseconds (default: 30000)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// QoS applied to subscriptions that do not name their own (default: 1)
    #[serde(default = "default_qos")]
    pub default_qos: u8,
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_timeout_ms() -> u64 {
    30000 // 30 seconds
}

fn default_qos() -> u8 {
    1 // at-least-once
}

impl MqttSection {
    /// Username resolved from the configured environment variable
    pub fn username(&self) -> Option<String> {
        resolve_env_var(self.username_env.as_ref())
    }

    /// Password resolved from the configured environment variable
    pub fn password(&self) -> Option<String> {
        resolve_env_var(self.password_env.as_ref())
    }

    /// Client id, generating one when the file names none
    ///
    /// The generated id is random per call; callers resolve it once at
    /// startup and reuse the same string for every reconnect so the broker
    /// can resume the session.
    pub fn resolved_client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("inletmq-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// One subscription entry from the config file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionEntry {
    /// MQTT topic filter, wildcards allowed
    pub filter: String,
    /// Per-topic QoS override; falls back to `mqtt.default_qos`
    pub qos: Option<u8>,
}

/// Bounded inbox settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboxSection {
    /// Maximum queued messages (default: 256)
    #[serde(default = "default_inbox_capacity")]
    pub capacity: usize,
    /// What to do when the inbox is full (default: block)
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

fn default_inbox_capacity() -> usize {
    256
}

impl Default for InboxSection {
    fn default() -> Self {
        Self {
            capacity: default_inbox_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Behavior when a message arrives at a full inbox
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Suspend intake until a slot frees up
    #[default]
    Block,
    /// Evict the oldest queued message to admit the new one
    DropOldest,
}

/// Reconnect backoff settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// First retry delay in milliseconds (default: 1000)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds (default: 30000)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before giving up; 0 retries forever
    #[serde(default)]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: 0,
        }
    }
}

impl ReconnectSection {
    /// Attempt ceiling, with 0 mapped to unlimited
    pub fn attempt_limit(&self) -> Option<u32> {
        (self.max_attempts > 0).then_some(self.max_attempts)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Dispatcher and retry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchSection {
    /// Number of handler workers (default: 4)
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Handler retries after the first attempt (default: 3)
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Pause between handler retries in milliseconds (default: 100)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Graceful-drain budget in milliseconds (default: 5000)
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_workers() -> usize {
    4
}

fn default_retry_limit() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            retry_limit: default_retry_limit(),
            retry_delay_ms: default_retry_delay_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl DispatchSection {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid client id: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConsumerConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ConsumerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.broker_url.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.broker_url must not be empty".to_string(),
            ));
        }
        if let Some(id) = &self.mqtt.client_id {
            validate_client_id(id)?;
        }
        validate_qos(self.mqtt.default_qos, "mqtt.default_qos")?;
        if self.subscriptions.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one [[subscriptions]] entry is required".to_string(),
            ));
        }
        for entry in &self.subscriptions {
            if entry.filter.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "subscription filter must not be empty".to_string(),
                ));
            }
            if let Some(qos) = entry.qos {
                validate_qos(qos, &format!("subscription '{}'", entry.filter))?;
            }
        }
        if self.inbox.capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "inbox.capacity must be at least 1".to_string(),
            ));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.base_delay_ms must be at least 1".to_string(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_delay_ms must be >= reconnect.base_delay_ms".to_string(),
            ));
        }
        if self.dispatch.workers == 0 {
            return Err(ConfigError::InvalidConfig(
                "dispatch.workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Subscription list with per-entry QoS resolved against the default
    pub fn resolved_subscriptions(&self) -> Result<Vec<TopicSubscription>, ConfigError> {
        self.subscriptions
            .iter()
            .map(|entry| {
                let level = entry.qos.unwrap_or(self.mqtt.default_qos);
                let qos = QosLevel::try_from(level).map_err(|e| {
                    ConfigError::InvalidConfig(format!(
                        "subscription '{}': {e}",
                        entry.filter
                    ))
                })?;
                Ok(TopicSubscription::new(entry.filter.clone(), qos))
            })
            .collect()
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
client_id = "inletmq-test"

[[subscriptions]]
filter = "sensors/#"

[inbox]
capacity = 16
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn resolve_env_var(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

/// Validate client id charset ([a-zA-Z0-9._-]+)
fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if client_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidClientId(format!(
            "Client id '{client_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

fn validate_qos(level: u8, context: &str) -> Result<(), ConfigError> {
    QosLevel::try_from(level)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidConfig(format!("{context}: {e}")))
}
