//! Provider types, capability sets and configuration.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for configuration overrides, e.g.
/// `MESSAGING__TOPIC=orders` sets `topic`.
pub const CONFIG_ENV_PREFIX: &str = "MESSAGING";

/// Default MQTT port when none is configured
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Enumeration of supported transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Mqtt,
    InMemory,
}

impl ProviderType {
    /// Get the capability set honoured by the provider's adapter
    pub fn capabilities(&self) -> Capabilities {
        match self {
            // Acknowledgement is QoS dependent; see MqttReceiver::capabilities
            Self::Mqtt => Capabilities {
                acknowledgement: true,
                rejection: false,
                keep_alive: false,
                dead_letter: false,
                message_count: false,
                message_properties: true,
            },
            Self::InMemory => Capabilities::all(),
        }
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mqtt => write!(f, "mqtt"),
            Self::InMemory => write!(f, "in-memory"),
        }
    }
}

/// Optional receiver operations an adapter actually performs.
///
/// Operations flagged `false` either fail with `NotSupported`
/// (`dead_letter`, `message_count`) or degrade to no-ops
/// (`keep_alive`, and acknowledgement/rejection on push-only transports).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub acknowledgement: bool,
    pub rejection: bool,
    pub keep_alive: bool,
    pub dead_letter: bool,
    pub message_count: bool,
    pub message_properties: bool,
}

impl Capabilities {
    /// Every optional operation supported
    pub fn all() -> Self {
        Self {
            acknowledgement: true,
            rejection: true,
            keep_alive: true,
            dead_letter: true,
            message_count: true,
            message_properties: true,
        }
    }
}

// ============================================================================
// MQTT Configuration
// ============================================================================

/// MQTT delivery guarantee level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityOfService {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QualityOfService {
    /// Whether deliveries at this level carry an acknowledgment protocol
    pub fn requires_acknowledgement(&self) -> bool {
        !matches!(self, Self::AtMostOnce)
    }
}

impl Default for QualityOfService {
    fn default() -> Self {
        Self::AtMostOnce
    }
}

/// MQTT wire protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "3.1.0")]
    V310,
    #[serde(rename = "3.1.1")]
    V311,
    #[serde(rename = "5.0.0")]
    V500,
}

impl ProtocolVersion {
    /// Per-message user properties exist only in MQTT 5
    pub fn supports_user_properties(&self) -> bool {
        matches!(self, Self::V500)
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::V311
    }
}

/// Connection and destination settings shared by MQTT publishers and receivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker host name or address
    pub address: String,

    /// Broker port, `DEFAULT_MQTT_PORT` when absent
    pub port: Option<u16>,

    /// Topic to publish to or subscribe on
    pub topic: String,

    pub quality_of_service: QualityOfService,

    /// Ask the broker to retain the last published message for late subscribers
    pub retain_message: bool,

    pub protocol_version: ProtocolVersion,

    /// Prefix for generated client identifiers
    pub client_id_prefix: String,

    pub keep_alive_seconds: u64,

    pub connect_timeout_seconds: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: None,
            topic: String::new(),
            quality_of_service: QualityOfService::default(),
            retain_message: false,
            protocol_version: ProtocolVersion::default(),
            client_id_prefix: "messaging".to_string(),
            keep_alive_seconds: 60,
            connect_timeout_seconds: 10,
        }
    }
}

impl MqttConfig {
    /// Create configuration for a broker address and topic with defaults elsewhere
    pub fn new(address: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            topic: topic.into(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_quality_of_service(mut self, qos: QualityOfService) -> Self {
        self.quality_of_service = qos;
        self
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_retain_message(mut self, retain: bool) -> Self {
        self.retain_message = retain;
        self
    }

    /// Port used to connect
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_MQTT_PORT)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Check required fields and value ranges
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.address.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "address".to_string(),
            });
        }

        if self.topic.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "topic".to_string(),
            });
        }

        if self.port == Some(0) {
            return Err(ConfigurationError::Invalid {
                message: "port must be between 1 and 65535".to_string(),
            });
        }

        if self.connect_timeout_seconds == 0 {
            return Err(ConfigurationError::Invalid {
                message: "connect_timeout_seconds must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// Load configuration from an optional file and `MESSAGING__*` environment variables.
    ///
    /// Sources are applied in order, later ones overriding earlier ones:
    ///  1. `path`, when given (format inferred from the extension)
    ///  2. Environment variables prefixed `MESSAGING__`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let loaded: Self = load_sources(path)?;
        loaded.validate()?;
        Ok(loaded)
    }
}

// ============================================================================
// In-Memory Queue Configuration
// ============================================================================

/// In-memory queue provider configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryConfig {
    /// Maximum number of messages handed to a handler at once
    pub max_batch_size: usize,

    /// Visibility window for delivered, unacknowledged messages
    pub lock_duration_seconds: u64,

    /// Deliveries before a message is dead-lettered; 0 means unlimited
    pub max_delivery_count: u32,

    pub enable_dead_letter_queue: bool,

    /// Interval between checks for expired locks while idle
    pub poll_interval_ms: u64,

    pub max_queue_size: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            lock_duration_seconds: 30,
            max_delivery_count: 3,
            enable_dead_letter_queue: true,
            poll_interval_ms: 50,
            max_queue_size: 10_000,
        }
    }
}

impl InMemoryConfig {
    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_batch_size == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_batch_size must be greater than zero".to_string(),
            });
        }

        if self.poll_interval_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "poll_interval_ms must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// Load configuration the same way as [`MqttConfig::load`]
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let loaded: Self = load_sources(path)?;
        loaded.validate()?;
        Ok(loaded)
    }
}

fn load_sources<T: serde::de::DeserializeOwned>(
    path: Option<&Path>,
) -> Result<T, ConfigurationError> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(true));
        tracing::info!(path = %path.display(), "Loading messaging configuration from file");
    }

    let settings = builder
        .add_source(
            config::Environment::with_prefix(CONFIG_ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| ConfigurationError::Parsing {
            message: e.to_string(),
        })?;

    settings
        .try_deserialize()
        .map_err(|e| ConfigurationError::Parsing {
            message: e.to_string(),
        })
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
