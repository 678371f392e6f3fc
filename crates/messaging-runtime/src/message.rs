//! Message envelope, property values and the typed JSON wrapper.

use crate::error::{SerializationError, ValidationError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Property key set on envelopes built from JSON objects
pub const CONTENT_TYPE_PROPERTY: &str = "content-type";

/// Content type used for JSON payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Unique identifier for messages, used as the acknowledgment correlation key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

// ============================================================================
// Property Values
// ============================================================================

/// Scalar value stored in a message property bag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl PropertyValue {
    /// Borrow the value as a string slice if it is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Boolean(value) => write!(f, "{}", value),
            Self::Integer(value) => write!(f, "{}", value),
            Self::Float(value) => write!(f, "{}", value),
            Self::String(value) => write!(f, "{}", value),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl PartialEq<&str> for PropertyValue {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == Some(*other)
    }
}

// ============================================================================
// Message Envelope
// ============================================================================

/// Immutable message envelope passed between publishers, receivers and handlers.
///
/// The content is never absent (it may be empty) and the property bag is
/// always present, even when no metadata was attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: MessageId,
    content: Bytes,
    properties: HashMap<String, PropertyValue>,
}

impl Message {
    /// Create new message with a generated ID and no properties
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId::new(),
            content: content.into(),
            properties: HashMap::new(),
        }
    }

    /// Create a message whose content is the JSON encoding of `value`
    pub fn from_json<T: Serialize + ?Sized>(value: &T) -> Result<Self, SerializationError> {
        let content = serde_json::to_vec(value)?;
        Ok(Self::new(content).with_property(CONTENT_TYPE_PROPERTY, JSON_CONTENT_TYPE))
    }

    /// Replace the message ID (broker-assigned identifiers)
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    /// Add a single property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Add all properties from an iterator, replacing existing keys
    pub fn with_properties<I, K, V>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PropertyValue>,
    {
        self.properties.extend(
            properties
                .into_iter()
                .map(|(key, value)| (key.into(), value.into())),
        );
        self
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn properties(&self) -> &HashMap<String, PropertyValue> {
        &self.properties
    }

    /// Look up a single property
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Parse the content as JSON
    pub fn deserialize_json<T: DeserializeOwned>(&self) -> Result<T, SerializationError> {
        Ok(serde_json::from_slice(&self.content)?)
    }

    /// Interpret the content as UTF-8 text
    pub fn content_str(&self) -> Result<&str, SerializationError> {
        std::str::from_utf8(&self.content).map_err(|_| SerializationError::InvalidUtf8)
    }
}

// ============================================================================
// Typed Message Wrapper
// ============================================================================

/// A received envelope together with its JSON-deserialized content.
///
/// `object` is `None` when the content could not be parsed as `T`; the
/// envelope is still available so the handler can decide to reject it.
#[derive(Debug, Clone)]
pub struct TypedMessage<T> {
    message: Message,
    object: Option<T>,
}

impl<T: DeserializeOwned> TypedMessage<T> {
    /// Wrap an envelope, parsing its content as `T`
    pub fn from_message(message: Message) -> Self {
        let object = match message.deserialize_json::<T>() {
            Ok(object) => Some(object),
            Err(e) => {
                tracing::debug!(
                    message_id = %message.id(),
                    error = %e,
                    "Message content could not be deserialized"
                );
                None
            }
        };

        Self { message, object }
    }
}

impl<T> TypedMessage<T> {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn object(&self) -> Option<&T> {
        self.object.as_ref()
    }

    /// Split into envelope and object
    pub fn into_parts(self) -> (Message, Option<T>) {
        (self.message, self.object)
    }
}

/// Recover the envelopes of a typed batch for confirm/reject calls
pub fn envelopes<T>(messages: &[TypedMessage<T>]) -> Vec<Message> {
    messages.iter().map(|m| m.message.clone()).collect()
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
