//! MQTT publisher and receiver adapters.
//!
//! MQTT is a push-only topic broker with a narrow capability set:
//! - No message counts, dead-letter destinations or lease renewal
//! - Acknowledgement only at QoS 1 and 2, where `confirm` acknowledges the
//!   recorded packet identifier
//! - No negative acknowledgement; `reject` releases the pending record and
//!   leaves redelivery to the broker's session semantics
//! - Per-message user properties only with protocol version 5
//!
//! The adapters never speak the wire protocol themselves. They drive a native
//! client through the [`MqttClient`] and [`MqttClientFactory`] traits.
//! [`NetworkMqttClientFactory`](super::NetworkMqttClientFactory) talks to a
//! real broker through `rumqttc`; the bundled
//! [`InMemoryMqttBroker`](super::InMemoryMqttBroker) runs in-process.
//!
//! ## Example
//!
//! ```no_run
//! use messaging_runtime::providers::{InMemoryMqttBroker, MqttPublisher, MqttReceiver};
//! use messaging_runtime::{message_handler, Message, MessagePublisher, MqttConfig, ReceiverExt, RetryPolicy};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Arc::new(InMemoryMqttBroker::new());
//! let config = MqttConfig::new("localhost", "orders/created");
//!
//! let receiver = MqttReceiver::new(config.clone(), broker.clone())?;
//! let cancel = CancellationToken::new();
//! let handler = message_handler(|messages, _cancel| async move {
//!     println!("received {} messages", messages.len());
//!     Ok(())
//! });
//! let policy = RetryPolicy::default();
//! let listening = receiver.listen_with_retry(handler, &policy, cancel.clone());
//!
//! let publisher = MqttPublisher::connect(config, broker).await?;
//! publisher.publish(vec![Message::new("hello")], &cancel).await?;
//! # drop(listening);
//! # Ok(())
//! # }
//! ```

use crate::client::{
    invoke_handler, ListenGuard, ListenState, MessageHandler, MessagePublisher, MessageReceiver,
};
use crate::error::{MessagingError, ValidationError};
use crate::message::{Message, MessageId, PropertyValue};
use crate::provider::{Capabilities, MqttConfig, ProtocolVersion, ProviderType, QualityOfService};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "mqtt_tests.rs"]
mod tests;

// ============================================================================
// Native Client Interface
// ============================================================================

/// Parameters for establishing a native connection
#[derive(Debug, Clone, PartialEq)]
pub struct MqttConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub protocol_version: ProtocolVersion,
    pub keep_alive: Duration,
    pub clean_session: bool,
}

/// An outbound application message
#[derive(Debug, Clone, PartialEq)]
pub struct MqttPublish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QualityOfService,
    pub retain: bool,
    pub user_properties: Vec<(String, String)>,
}

/// An inbound application message
#[derive(Debug, Clone, PartialEq)]
pub struct MqttDelivery {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QualityOfService,
    pub retain: bool,
    /// Present when the delivery awaits an acknowledgement (QoS 1 and 2)
    pub packet_id: Option<u16>,
    pub user_properties: Vec<(String, String)>,
}

/// Notification pushed by a native client
#[derive(Debug, Clone, PartialEq)]
pub enum MqttEvent {
    Message(MqttDelivery),
    Disconnected { reason: String },
}

/// Native MQTT connection driven by the adapters.
///
/// Deliveries arrive on the channel returned by [`MqttClient::events`]; the
/// native library pushes into it from its own task.
#[async_trait]
pub trait MqttClient: Send + Sync {
    async fn connect(&self, options: &MqttConnectOptions) -> Result<(), MessagingError>;

    /// Close the connection. Disconnecting a closed client succeeds.
    async fn disconnect(&self) -> Result<(), MessagingError>;

    async fn subscribe(&self, topic: &str, qos: QualityOfService) -> Result<(), MessagingError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), MessagingError>;

    async fn publish(&self, publish: MqttPublish) -> Result<(), MessagingError>;

    /// Take the event stream. Only the first call succeeds.
    fn events(&self) -> Result<mpsc::UnboundedReceiver<MqttEvent>, MessagingError>;

    /// Acknowledge a QoS 1 or 2 delivery
    async fn acknowledge(&self, packet_id: u16) -> Result<(), MessagingError>;

    fn client_id(&self) -> &str;
}

/// Creates native clients; each adapter connection gets a fresh one
pub trait MqttClientFactory: Send + Sync {
    fn create_client(&self, client_id: &str) -> Arc<dyn MqttClient>;
}

// ============================================================================
// Topic Helpers
// ============================================================================

/// Check that `topic` can be published to (non-empty, no wildcards)
pub fn validate_topic_name(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::Required {
            field: "topic".to_string(),
        });
    }

    if topic.contains(['+', '#']) {
        return Err(ValidationError::InvalidFormat {
            field: "topic".to_string(),
            message: format!("'{}' contains wildcards and cannot be published to", topic),
        });
    }

    Ok(())
}

/// Check that `filter` is a well-formed subscription filter
pub fn validate_topic_filter(filter: &str) -> Result<(), ValidationError> {
    if filter.is_empty() {
        return Err(ValidationError::Required {
            field: "topic".to_string(),
        });
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        let misplaced_multi = level.contains('#') && (*level != "#" || index != levels.len() - 1);
        let misplaced_single = level.contains('+') && *level != "+";
        if misplaced_multi || misplaced_single {
            return Err(ValidationError::InvalidFormat {
                field: "topic".to_string(),
                message: format!("'{}' uses wildcards outside a whole level", filter),
            });
        }
    }

    Ok(())
}

/// Match a topic name against a subscription filter.
///
/// `+` matches exactly one level, a trailing `#` matches the parent level
/// and everything below it. Topics starting with `$` are never matched by a
/// leading wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn generate_client_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

fn connect_options(config: &MqttConfig, client_id: &str) -> MqttConnectOptions {
    MqttConnectOptions {
        host: config.address.clone(),
        port: config.effective_port(),
        client_id: client_id.to_string(),
        protocol_version: config.protocol_version,
        keep_alive: config.keep_alive(),
        clean_session: true,
    }
}

async fn connect_client(
    client: &dyn MqttClient,
    config: &MqttConfig,
) -> Result<(), MessagingError> {
    let options = connect_options(config, client.client_id());
    let duration = config.connect_timeout();

    match tokio::time::timeout(duration, client.connect(&options)).await {
        Ok(result) => result,
        Err(_) => Err(MessagingError::Timeout { duration }),
    }
}

/// Disconnect a client that is being abandoned, including half-open ones
async fn release_client(client: &dyn MqttClient) {
    if let Err(e) = client.disconnect().await {
        debug!(client_id = %client.client_id(), error = %e, "Disconnect failed while releasing client");
    }
}

// ============================================================================
// MqttPublisher
// ============================================================================

/// Publishes envelopes to the configured topic over one native connection
pub struct MqttPublisher {
    config: MqttConfig,
    client: Arc<dyn MqttClient>,
    closed: AtomicBool,
}

impl MqttPublisher {
    /// Validate the configuration and connect to the broker
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The configuration is invalid or the topic contains wildcards
    /// - The broker refuses the connection or does not answer in time
    pub async fn connect(
        config: MqttConfig,
        factory: Arc<dyn MqttClientFactory>,
    ) -> Result<Self, MessagingError> {
        config.validate()?;
        validate_topic_name(&config.topic)?;

        let client = factory.create_client(&generate_client_id(&config.client_id_prefix));
        if let Err(e) = connect_client(client.as_ref(), &config).await {
            release_client(client.as_ref()).await;
            return Err(e);
        }

        info!(
            topic = %config.topic,
            client_id = %client.client_id(),
            "MQTT publisher connected"
        );

        Ok(Self {
            config,
            client,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    fn to_publish(&self, message: &Message) -> MqttPublish {
        let user_properties = if self.config.protocol_version.supports_user_properties() {
            message
                .properties()
                .iter()
                .map(|(key, value)| (key.clone(), value.to_string()))
                .collect()
        } else {
            Vec::new()
        };

        MqttPublish {
            topic: self.config.topic.clone(),
            payload: message.content().clone(),
            qos: self.config.quality_of_service,
            retain: self.config.retain_message,
            user_properties,
        }
    }
}

#[async_trait]
impl MessagePublisher for MqttPublisher {
    async fn publish(
        &self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<(), MessagingError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MessagingError::ConnectionFailed {
                message: "publisher has been closed".to_string(),
            });
        }

        let total = messages.len();
        for (sent, message) in messages.iter().enumerate() {
            if cancel.is_cancelled() {
                debug!(
                    topic = %self.config.topic,
                    skipped = total - sent,
                    "Publish cancelled; skipping remaining messages"
                );
                break;
            }

            self.client.publish(self.to_publish(message)).await?;
            debug!(topic = %self.config.topic, message_id = %message.id(), "Message published");
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!(topic = %self.config.topic, "Closing MQTT publisher");
        self.client.disconnect().await
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Mqtt
    }
}

// ============================================================================
// MqttReceiver
// ============================================================================

/// Subscribes to the configured topic and hands deliveries to a handler.
///
/// Each `listen` call opens its own native connection and tears it down
/// before returning. Only one `listen` may run at a time.
pub struct MqttReceiver {
    config: MqttConfig,
    factory: Arc<dyn MqttClientFactory>,
    connection: Mutex<Option<Arc<dyn MqttClient>>>,
    pending: Arc<Mutex<HashMap<MessageId, u16>>>,
    listening: AtomicBool,
    state: watch::Sender<ListenState>,
}

impl MqttReceiver {
    /// Create a receiver. No connection is made until `listen` is called.
    pub fn new(
        config: MqttConfig,
        factory: Arc<dyn MqttClientFactory>,
    ) -> Result<Self, MessagingError> {
        config.validate()?;
        validate_topic_filter(&config.topic)?;

        let (state, _) = watch::channel(ListenState::Disconnected);

        Ok(Self {
            config,
            factory,
            connection: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            listening: AtomicBool::new(false),
            state,
        })
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    /// Current phase of the listen state machine
    pub fn state(&self) -> ListenState {
        *self.state.borrow()
    }

    /// Watch listen state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ListenState> {
        self.state.subscribe()
    }

    /// Number of delivered envelopes still awaiting confirm or reject
    pub async fn pending_acknowledgements(&self) -> usize {
        self.pending.lock().await.len()
    }

    fn transition(&self, next: ListenState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(topic = %self.config.topic, from = %previous, to = %next, "Listen state changed");
        }
    }

    async fn run_pass(
        &self,
        handler: &MessageHandler,
        cancel: &CancellationToken,
    ) -> Result<(), MessagingError> {
        self.transition(ListenState::Connecting);

        let client = self
            .factory
            .create_client(&generate_client_id(&self.config.client_id_prefix));
        let mut events = client.events()?;

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                release_client(client.as_ref()).await;
                return Ok(());
            }
            connected = connect_client(client.as_ref(), &self.config) => connected,
        };
        if let Err(e) = connected {
            release_client(client.as_ref()).await;
            return Err(e);
        }

        *self.connection.lock().await = Some(Arc::clone(&client));

        if let Err(e) = client
            .subscribe(&self.config.topic, self.config.quality_of_service)
            .await
        {
            self.teardown(client.as_ref(), false).await;
            return Err(MessagingError::Transport {
                message: format!("subscribe to '{}' failed: {}", self.config.topic, e),
            });
        }

        self.transition(ListenState::Subscribed);
        info!(
            topic = %self.config.topic,
            client_id = %client.client_id(),
            qos = ?self.config.quality_of_service,
            "MQTT receiver subscribed"
        );

        let outcome = loop {
            self.transition(ListenState::Idle);

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                event = events.recv() => event,
            };

            match event {
                Some(MqttEvent::Message(delivery)) => {
                    self.transition(ListenState::Delivering);
                    let message = self.to_envelope(delivery).await;
                    self.deliver(handler, vec![message], cancel).await;
                }
                Some(MqttEvent::Disconnected { reason }) => {
                    break Err(MessagingError::Transport {
                        message: format!("connection lost: {}", reason),
                    });
                }
                None => {
                    break Err(MessagingError::Transport {
                        message: "native event stream closed".to_string(),
                    });
                }
            }
        };

        self.teardown(client.as_ref(), outcome.is_ok()).await;
        outcome
    }

    async fn to_envelope(&self, delivery: MqttDelivery) -> Message {
        let id = MessageId::new();

        if let Some(packet_id) = delivery.packet_id {
            if self.config.quality_of_service.requires_acknowledgement() {
                self.pending.lock().await.insert(id.clone(), packet_id);
            }
        }

        debug!(
            topic = %delivery.topic,
            message_id = %id,
            packet_id = ?delivery.packet_id,
            retained = delivery.retain,
            "Message delivered"
        );

        Message::new(delivery.payload)
            .with_id(id)
            .with_properties(
                delivery
                    .user_properties
                    .into_iter()
                    .map(|(key, value)| (key, PropertyValue::String(value))),
            )
    }

    async fn deliver(
        &self,
        handler: &MessageHandler,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) {
        let Err(e) = invoke_handler(handler, messages.clone(), cancel.clone()).await else {
            return;
        };

        warn!(
            topic = %self.config.topic,
            batch_size = messages.len(),
            error = %e,
            "Message handler failed; rejecting batch"
        );

        if cancel.is_cancelled() {
            return;
        }

        if let Err(e) = self.reject(&messages, cancel).await {
            warn!(topic = %self.config.topic, error = %e, "Failed to reject batch");
        }
    }

    async fn teardown(&self, client: &dyn MqttClient, unsubscribe: bool) {
        self.transition(ListenState::Unsubscribing);

        if unsubscribe {
            if let Err(e) = client.unsubscribe(&self.config.topic).await {
                debug!(topic = %self.config.topic, error = %e, "Unsubscribe failed during teardown");
            }
        }

        release_client(client).await;

        *self.connection.lock().await = None;

        // Packet ids are scoped to the connection that issued them
        self.pending.lock().await.clear();

        info!(topic = %self.config.topic, client_id = %client.client_id(), "MQTT receiver disconnected");
    }
}

#[async_trait]
impl MessageReceiver for MqttReceiver {
    async fn listen(
        &self,
        handler: MessageHandler,
        cancel: CancellationToken,
    ) -> Result<(), MessagingError> {
        let _guard = ListenGuard::acquire(&self.listening)?;

        let result = self.run_pass(&handler, &cancel).await;
        self.transition(ListenState::Disconnected);
        result
    }

    async fn confirm(
        &self,
        messages: &[Message],
        _cancel: &CancellationToken,
    ) -> Result<(), MessagingError> {
        if !self.config.quality_of_service.requires_acknowledgement() {
            return Ok(());
        }

        // A record is removed only once its acknowledgement succeeds
        let unacknowledged: Vec<(MessageId, u16)> = {
            let pending = self.pending.lock().await;
            messages
                .iter()
                .filter_map(|message| {
                    pending
                        .get(message.id())
                        .map(|packet_id| (message.id().clone(), *packet_id))
                })
                .collect()
        };

        if unacknowledged.is_empty() {
            return Ok(());
        }

        let client = self.connection.lock().await.clone().ok_or_else(|| {
            MessagingError::ConnectionFailed {
                message: "receiver is not connected".to_string(),
            }
        })?;

        for (message_id, packet_id) in unacknowledged {
            client.acknowledge(packet_id).await?;
            self.pending.lock().await.remove(&message_id);
            debug!(topic = %self.config.topic, packet_id, "Delivery acknowledged");
        }

        Ok(())
    }

    async fn reject(
        &self,
        messages: &[Message],
        _cancel: &CancellationToken,
    ) -> Result<(), MessagingError> {
        if !self.config.quality_of_service.requires_acknowledgement() {
            return Ok(());
        }

        let mut pending = self.pending.lock().await;
        for message in messages {
            if pending.remove(message.id()).is_some() {
                debug!(
                    topic = %self.config.topic,
                    message_id = %message.id(),
                    "Delivery released without acknowledgement"
                );
            }
        }

        Ok(())
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Mqtt
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            acknowledgement: self.config.quality_of_service.requires_acknowledgement(),
            ..ProviderType::Mqtt.capabilities()
        }
    }
}
