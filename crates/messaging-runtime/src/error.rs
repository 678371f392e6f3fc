//! Error types for messaging operations.

use crate::provider::ProviderType;
use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all publisher and receiver operations
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Operation '{operation}' is not supported by the {provider} provider")]
    NotSupported {
        operation: String,
        provider: ProviderType,
    },

    #[error("Receiver is already listening; the native connection cannot be shared")]
    ListenerActive,

    #[error("Queue is full (max: {max_size} messages)")]
    QueueFull { max_size: usize },

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl MessagingError {
    /// Create a `NotSupported` error for an operation on a provider
    pub fn not_supported(operation: &str, provider: ProviderType) -> Self {
        Self::NotSupported {
            operation: operation.to_string(),
            provider,
        }
    }

    /// Check if error is transient and the operation may succeed after reconnecting
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } => true,
            Self::Transport { .. } => true,
            Self::Timeout { .. } => true,
            Self::NotSupported { .. } => false,
            Self::ListenerActive => false,
            Self::QueueFull { .. } => false,
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }

    /// Check if error should be retried
    pub fn should_retry(&self) -> bool {
        self.is_transient()
    }
}

/// Errors during message serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Message content is not valid UTF-8")]
    InvalidUtf8,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
