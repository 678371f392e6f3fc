//! # Messaging Runtime
//!
//! Transport-agnostic publish/receive contracts with a resilient listen loop
//! and an MQTT reference adapter.
//!
//! This library provides:
//! - A message envelope (identifier, binary content, property bag) and a
//!   typed JSON wrapper
//! - Publisher and receiver traits with capability-checked optional operations
//! - A retry-wrapped listen loop that reconnects after transport failures
//! - An MQTT adapter over a pluggable native client, plus an in-process broker
//! - An in-memory queue adapter with acknowledgement locks and dead-lettering
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all messaging operations
//! - [`message`] - Envelope, property values and typed messages
//! - [`provider`] - Provider types, capabilities and configuration
//! - [`client`] - Publisher/receiver traits and handler helpers
//! - [`retry`] - Backoff policy and the retry-wrapped listen loop
//! - [`providers`] - Transport adapters
//!
//! ## Example
//!
//! ```rust
//! use messaging_runtime::{
//!     envelopes, typed_handler, InMemoryQueue, MessagePublisher, MessageReceiver,
//!     PublisherExt, ReceiverExt, RetryPolicy, TypedMessage,
//! };
//! use serde::{Deserialize, Serialize};
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrderPlaced {
//!     order_id: String,
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = InMemoryQueue::default();
//! let cancel = CancellationToken::new();
//!
//! queue
//!     .publish_as_json(&[OrderPlaced { order_id: "A-1".to_string() }], &cancel)
//!     .await?;
//!
//! let receiver = queue.clone();
//! let stop = cancel.clone();
//! let handler = typed_handler(move |orders: Vec<TypedMessage<OrderPlaced>>, token| {
//!     let receiver = receiver.clone();
//!     let stop = stop.clone();
//!     async move {
//!         for order in &orders {
//!             if let Some(order) = order.object() {
//!                 println!("processing {}", order.order_id);
//!             }
//!         }
//!         receiver.confirm(&envelopes(&orders), &token).await?;
//!         stop.cancel();
//!         Ok(())
//!     }
//! });
//!
//! queue
//!     .listen_and_deserialize_json(handler, &RetryPolicy::default(), cancel)
//!     .await?;
//! # Ok(())
//! # }
//! ```

// Module declarations
pub mod client;
pub mod error;
pub mod message;
pub mod provider;
pub mod providers;
pub mod retry;

// Re-export commonly used types at crate root for convenience
pub use client::{
    handler, json_handler, message_handler, typed_handler, Handler, HandlerError, HandlerFuture,
    ListenState, MessageHandler, MessagePublisher, MessageReceiver, PublisherExt, ReceiverExt,
    TypedHandler,
};
pub use error::{ConfigurationError, MessagingError, SerializationError, ValidationError};
pub use message::{
    envelopes, Message, MessageId, PropertyValue, Timestamp, TypedMessage, CONTENT_TYPE_PROPERTY,
    JSON_CONTENT_TYPE,
};
pub use provider::{
    Capabilities, InMemoryConfig, MqttConfig, ProtocolVersion, ProviderType, QualityOfService,
};
pub use providers::{
    InMemoryMqttBroker, InMemoryQueue, MqttPublisher, MqttReceiver, NetworkMqttClientFactory,
};
pub use retry::{listen_with_retry, RetryPolicy, RetryState};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
