//! In-process MQTT broker for tests and local development.
//!
//! [`InMemoryMqttBroker`] implements [`MqttClientFactory`] so the MQTT
//! adapters can run without a network broker. It follows the MQTT routing
//! rules the adapters rely on:
//! - Topic filters with `+` and `#` wildcards
//! - Retained messages replayed to new subscriptions
//! - User properties carried only between protocol version 5 clients
//! - Delivery QoS downgraded to the subscription QoS, with packet ids issued
//!   for QoS 1 and 2 and tracked until acknowledged
//!
//! Fault injection (`fail_next_connects`, `drop_connections`) and counters
//! (`connect_count`, `acknowledgement_count`) let tests observe reconnect and
//! acknowledgement behaviour.

use super::mqtt::{
    topic_matches, validate_topic_filter, validate_topic_name, MqttClient, MqttClientFactory,
    MqttConnectOptions, MqttDelivery, MqttEvent, MqttPublish,
};
use crate::error::MessagingError;
use crate::provider::{ProtocolVersion, QualityOfService};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

#[cfg(test)]
#[path = "mqtt_broker_tests.rs"]
mod tests;

// ============================================================================
// Internal Broker State
// ============================================================================

/// A connected client session
struct Session {
    protocol_version: ProtocolVersion,
    subscriptions: HashMap<String, QualityOfService>,
    events: mpsc::UnboundedSender<MqttEvent>,
}

/// Last retained message for a topic
#[derive(Clone)]
struct RetainedMessage {
    payload: Bytes,
    qos: QualityOfService,
    user_properties: Vec<(String, String)>,
}

#[derive(Default)]
struct BrokerState {
    sessions: HashMap<String, Session>,
    retained: HashMap<String, RetainedMessage>,
    /// Deliveries awaiting acknowledgement, keyed by (client id, packet id)
    unacknowledged: HashSet<(String, u16)>,
    last_packet_id: u16,
    connect_count: usize,
    failing_connects: usize,
    failing_acknowledgements: usize,
    published_count: usize,
    acknowledgement_count: usize,
}

impl BrokerState {
    fn next_packet_id(&mut self) -> u16 {
        // Packet id 0 is reserved
        self.last_packet_id = self.last_packet_id.checked_add(1).unwrap_or(1);
        self.last_packet_id
    }

    /// Send a delivery to one session, issuing a packet id when it must be acknowledged
    fn deliver(
        &mut self,
        client_id: &str,
        topic: &str,
        message: &RetainedMessage,
        subscription_qos: QualityOfService,
        retain: bool,
    ) {
        let Some(protocol_version) = self
            .sessions
            .get(client_id)
            .map(|session| session.protocol_version)
        else {
            return;
        };

        let qos = message.qos.min(subscription_qos);
        let packet_id = if qos.requires_acknowledgement() {
            let packet_id = self.next_packet_id();
            self.unacknowledged.insert((client_id.to_string(), packet_id));
            Some(packet_id)
        } else {
            None
        };

        let user_properties = if protocol_version.supports_user_properties() {
            message.user_properties.clone()
        } else {
            Vec::new()
        };

        let delivery = MqttDelivery {
            topic: topic.to_string(),
            payload: message.payload.clone(),
            qos,
            retain,
            packet_id,
            user_properties,
        };

        if let Some(session) = self.sessions.get(client_id) {
            if session.events.send(MqttEvent::Message(delivery)).is_err() {
                tracing::debug!(client_id, topic, "Dropping delivery for closed event stream");
            }
        }
    }
}

// ============================================================================
// InMemoryMqttBroker
// ============================================================================

/// Shared in-process broker; clone or wrap in `Arc` to hand to adapters
#[derive(Clone, Default)]
pub struct InMemoryMqttBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryMqttBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` connection attempts
    pub async fn fail_next_connects(&self, count: usize) {
        self.state.lock().await.failing_connects = count;
    }

    /// Fail the next `count` acknowledgements without recording them
    pub async fn fail_next_acknowledgements(&self, count: usize) {
        self.state.lock().await.failing_acknowledgements = count;
    }

    /// Drop every live connection as if the network failed.
    ///
    /// Each client is sent a `Disconnected` event. Returns the number of
    /// connections dropped.
    pub async fn drop_connections(&self) -> usize {
        let mut state = self.state.lock().await;
        let sessions: Vec<(String, Session)> = state.sessions.drain().collect();

        for (client_id, session) in &sessions {
            if session
                .events
                .send(MqttEvent::Disconnected {
                    reason: "connection dropped by broker".to_string(),
                })
                .is_err()
            {
                tracing::debug!(client_id = %client_id, "Dropped client had no event listener");
            }
            state.unacknowledged.retain(|(owner, _)| owner != client_id);
        }

        tracing::info!(dropped = sessions.len(), "Broker dropped all connections");
        sessions.len()
    }

    /// Successful connections accepted so far
    pub async fn connect_count(&self) -> usize {
        self.state.lock().await.connect_count
    }

    /// Clients currently connected
    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Connected clients whose subscriptions match `topic`
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .await
            .sessions
            .values()
            .filter(|session| {
                session
                    .subscriptions
                    .keys()
                    .any(|filter| topic_matches(filter, topic))
            })
            .count()
    }

    /// Application messages accepted from publishers
    pub async fn published_count(&self) -> usize {
        self.state.lock().await.published_count
    }

    /// Deliveries acknowledged by subscribers
    pub async fn acknowledgement_count(&self) -> usize {
        self.state.lock().await.acknowledgement_count
    }

    /// Deliveries issued with a packet id and not yet acknowledged
    pub async fn unacknowledged_count(&self) -> usize {
        self.state.lock().await.unacknowledged.len()
    }

    /// Payload of the retained message for `topic`, if any
    pub async fn retained_payload(&self, topic: &str) -> Option<Bytes> {
        self.state
            .lock()
            .await
            .retained
            .get(topic)
            .map(|retained| retained.payload.clone())
    }
}

impl MqttClientFactory for InMemoryMqttBroker {
    fn create_client(&self, client_id: &str) -> Arc<dyn MqttClient> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Arc::new(InMemoryMqttClient {
            broker: self.clone(),
            client_id: client_id.to_string(),
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
        })
    }
}

// ============================================================================
// InMemoryMqttClient
// ============================================================================

/// Native client connected to an [`InMemoryMqttBroker`]
pub struct InMemoryMqttClient {
    broker: InMemoryMqttBroker,
    client_id: String,
    events_tx: mpsc::UnboundedSender<MqttEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<MqttEvent>>>,
}

impl InMemoryMqttClient {
    fn not_connected(&self) -> MessagingError {
        MessagingError::ConnectionFailed {
            message: format!("client '{}' is not connected", self.client_id),
        }
    }
}

#[async_trait]
impl MqttClient for InMemoryMqttClient {
    async fn connect(&self, options: &MqttConnectOptions) -> Result<(), MessagingError> {
        let mut state = self.broker.state.lock().await;

        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(MessagingError::ConnectionFailed {
                message: format!("broker refused connection from '{}'", self.client_id),
            });
        }

        // A new connection with the same id takes over the old session
        if let Some(previous) = state.sessions.remove(&self.client_id) {
            if previous
                .events
                .send(MqttEvent::Disconnected {
                    reason: "session taken over".to_string(),
                })
                .is_err()
            {
                tracing::debug!(client_id = %self.client_id, "Replaced session had no event listener");
            }
        }

        state.sessions.insert(
            self.client_id.clone(),
            Session {
                protocol_version: options.protocol_version,
                subscriptions: HashMap::new(),
                events: self.events_tx.clone(),
            },
        );
        state.connect_count += 1;

        tracing::debug!(
            client_id = %self.client_id,
            host = %options.host,
            port = options.port,
            protocol_version = ?options.protocol_version,
            "Client connected"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MessagingError> {
        let mut state = self.broker.state.lock().await;
        if state.sessions.remove(&self.client_id).is_some() {
            let client_id = self.client_id.as_str();
            state.unacknowledged.retain(|(owner, _)| owner != client_id);
            tracing::debug!(client_id, "Client disconnected");
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QualityOfService) -> Result<(), MessagingError> {
        validate_topic_filter(topic)?;

        let mut state = self.broker.state.lock().await;
        let session = state
            .sessions
            .get_mut(&self.client_id)
            .ok_or_else(|| self.not_connected())?;
        session.subscriptions.insert(topic.to_string(), qos);

        let retained: Vec<(String, RetainedMessage)> = state
            .retained
            .iter()
            .filter(|(name, _)| topic_matches(topic, name))
            .map(|(name, message)| (name.clone(), message.clone()))
            .collect();

        for (name, message) in retained {
            state.deliver(&self.client_id, &name, &message, qos, true);
        }

        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MessagingError> {
        let mut state = self.broker.state.lock().await;
        let session = state
            .sessions
            .get_mut(&self.client_id)
            .ok_or_else(|| self.not_connected())?;
        session.subscriptions.remove(topic);
        Ok(())
    }

    async fn publish(&self, publish: MqttPublish) -> Result<(), MessagingError> {
        validate_topic_name(&publish.topic)?;

        let mut state = self.broker.state.lock().await;
        let sender_version = state
            .sessions
            .get(&self.client_id)
            .map(|session| session.protocol_version)
            .ok_or_else(|| self.not_connected())?;

        let message = RetainedMessage {
            payload: publish.payload,
            qos: publish.qos,
            user_properties: if sender_version.supports_user_properties() {
                publish.user_properties
            } else {
                Vec::new()
            },
        };

        if publish.retain {
            if message.payload.is_empty() {
                state.retained.remove(&publish.topic);
            } else {
                state.retained.insert(publish.topic.clone(), message.clone());
            }
        }

        let targets: Vec<(String, QualityOfService)> = state
            .sessions
            .iter()
            .filter_map(|(client_id, session)| {
                session
                    .subscriptions
                    .iter()
                    .filter(|(filter, _)| topic_matches(filter, &publish.topic))
                    .map(|(_, qos)| *qos)
                    .max()
                    .map(|qos| (client_id.clone(), qos))
            })
            .collect();

        for (client_id, qos) in targets {
            state.deliver(&client_id, &publish.topic, &message, qos, false);
        }

        state.published_count += 1;
        Ok(())
    }

    fn events(&self) -> Result<mpsc::UnboundedReceiver<MqttEvent>, MessagingError> {
        self.events_rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| MessagingError::Transport {
                message: format!("event stream of '{}' already taken", self.client_id),
            })
    }

    async fn acknowledge(&self, packet_id: u16) -> Result<(), MessagingError> {
        let mut state = self.broker.state.lock().await;
        if !state.sessions.contains_key(&self.client_id) {
            return Err(self.not_connected());
        }

        if state.failing_acknowledgements > 0 {
            state.failing_acknowledgements -= 1;
            return Err(MessagingError::Transport {
                message: format!("acknowledgement of packet {} was lost", packet_id),
            });
        }

        if state
            .unacknowledged
            .remove(&(self.client_id.clone(), packet_id))
        {
            state.acknowledgement_count += 1;
        }
        Ok(())
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }
}
