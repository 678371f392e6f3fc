//! Network MQTT client backed by `rumqttc`.
//!
//! [`NetworkMqttClientFactory`] connects the MQTT adapters to a real broker
//! over TCP. Protocol version 5 uses the `rumqttc::v5` client so user
//! properties travel with each message; versions 3.1 and 3.1.1 use the
//! `rumqttc` 3.1.1 client.
//!
//! Each connection drives the `rumqttc` event loop on its own task. Incoming
//! publishes and connection loss are forwarded to the adapter's event channel.
//! Manual acknowledgement is enabled, so QoS 1 and 2 deliveries are only
//! acknowledged when the adapter calls [`MqttClient::acknowledge`].
//!
//! ```no_run
//! use messaging_runtime::providers::{MqttReceiver, NetworkMqttClientFactory};
//! use messaging_runtime::MqttConfig;
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), messaging_runtime::MessagingError> {
//! let factory = Arc::new(NetworkMqttClientFactory::new());
//! let receiver = MqttReceiver::new(MqttConfig::new("broker.local", "orders/#"), factory)?;
//! # drop(receiver);
//! # Ok(())
//! # }
//! ```

use super::mqtt::{
    MqttClient, MqttClientFactory, MqttConnectOptions, MqttDelivery, MqttEvent, MqttPublish,
};
use crate::error::MessagingError;
use crate::provider::{ProtocolVersion, QualityOfService};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{
    Packet as PacketV5, Publish as PublishV5, PublishProperties,
};
use rumqttc::v5::mqttbytes::QoS as QoSV5;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "mqtt_network_tests.rs"]
mod tests;

/// Default capacity of the `rumqttc` request channel
pub const DEFAULT_REQUEST_CAPACITY: usize = 64;

/// Shortest keep-alive interval `rumqttc` accepts
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Time the event loop gets to flush a DISCONNECT before it is stopped
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

// ============================================================================
// QoS Conversion
// ============================================================================

fn to_qos(qos: QualityOfService) -> rumqttc::QoS {
    match qos {
        QualityOfService::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QualityOfService::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QualityOfService::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn from_qos(qos: rumqttc::QoS) -> QualityOfService {
    match qos {
        rumqttc::QoS::AtMostOnce => QualityOfService::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QualityOfService::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QualityOfService::ExactlyOnce,
    }
}

fn to_qos_v5(qos: QualityOfService) -> QoSV5 {
    match qos {
        QualityOfService::AtMostOnce => QoSV5::AtMostOnce,
        QualityOfService::AtLeastOnce => QoSV5::AtLeastOnce,
        QualityOfService::ExactlyOnce => QoSV5::ExactlyOnce,
    }
}

fn from_qos_v5(qos: QoSV5) -> QualityOfService {
    match qos {
        QoSV5::AtMostOnce => QualityOfService::AtMostOnce,
        QoSV5::AtLeastOnce => QualityOfService::AtLeastOnce,
        QoSV5::ExactlyOnce => QualityOfService::ExactlyOnce,
    }
}

fn topic_string(topic: &[u8]) -> String {
    String::from_utf8_lossy(topic).into_owned()
}

fn transport_error(operation: &str, error: impl std::fmt::Display) -> MessagingError {
    MessagingError::Transport {
        message: format!("{} failed: {}", operation, error),
    }
}

// ============================================================================
// Event Loop Drivers
// ============================================================================

/// Shared between a connection's client handle and its event loop task
struct Forwarder {
    client_id: String,
    events: mpsc::UnboundedSender<MqttEvent>,
    closing: Arc<AtomicBool>,
}

impl Forwarder {
    /// Returns false once nobody is listening for events
    fn deliver(&self, delivery: MqttDelivery) -> bool {
        self.events.send(MqttEvent::Message(delivery)).is_ok()
    }

    fn connection_lost(&self, reason: String) {
        if self.closing.load(Ordering::Acquire) {
            debug!(client_id = %self.client_id, reason = %reason, "Event loop stopped after disconnect");
            return;
        }

        warn!(client_id = %self.client_id, reason = %reason, "MQTT connection lost");
        if self
            .events
            .send(MqttEvent::Disconnected { reason })
            .is_err()
        {
            debug!(client_id = %self.client_id, "Connection loss had no event listener");
        }
    }
}

async fn await_connack_v311(event_loop: &mut rumqttc::EventLoop) -> Result<(), MessagingError> {
    loop {
        match event_loop.poll().await {
            Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(e) => {
                return Err(MessagingError::ConnectionFailed {
                    message: e.to_string(),
                })
            }
        }
    }
}

async fn drive_v311(
    mut event_loop: rumqttc::EventLoop,
    forwarder: Forwarder,
    deliveries: Arc<Mutex<HashMap<u16, rumqttc::Publish>>>,
) {
    loop {
        match event_loop.poll().await {
            Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                let packet_id =
                    (publish.qos != rumqttc::QoS::AtMostOnce).then_some(publish.pkid);
                if let Some(packet_id) = packet_id {
                    deliveries.lock().await.insert(packet_id, publish.clone());
                }

                let delivery = MqttDelivery {
                    topic: topic_string(publish.topic.as_ref()),
                    payload: publish.payload.clone(),
                    qos: from_qos(publish.qos),
                    retain: publish.retain,
                    packet_id,
                    user_properties: Vec::new(),
                };
                if !forwarder.deliver(delivery) {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                forwarder.connection_lost(e.to_string());
                break;
            }
        }
    }
}

async fn await_connack_v5(
    event_loop: &mut rumqttc::v5::EventLoop,
) -> Result<(), MessagingError> {
    loop {
        match event_loop.poll().await {
            Ok(rumqttc::v5::Event::Incoming(PacketV5::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(e) => {
                return Err(MessagingError::ConnectionFailed {
                    message: e.to_string(),
                })
            }
        }
    }
}

async fn drive_v5(
    mut event_loop: rumqttc::v5::EventLoop,
    forwarder: Forwarder,
    deliveries: Arc<Mutex<HashMap<u16, PublishV5>>>,
) {
    loop {
        match event_loop.poll().await {
            Ok(rumqttc::v5::Event::Incoming(PacketV5::Publish(publish))) => {
                let packet_id = (publish.qos != QoSV5::AtMostOnce).then_some(publish.pkid);
                if let Some(packet_id) = packet_id {
                    deliveries.lock().await.insert(packet_id, publish.clone());
                }

                let user_properties = publish
                    .properties
                    .as_ref()
                    .map(|properties| properties.user_properties.clone())
                    .unwrap_or_default();

                let delivery = MqttDelivery {
                    topic: topic_string(publish.topic.as_ref()),
                    payload: publish.payload.clone(),
                    qos: from_qos_v5(publish.qos),
                    retain: publish.retain,
                    packet_id,
                    user_properties,
                };
                if !forwarder.deliver(delivery) {
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                forwarder.connection_lost(e.to_string());
                break;
            }
        }
    }
}

// ============================================================================
// NetworkMqttClient
// ============================================================================

/// A live `rumqttc` connection for one protocol family
enum Session {
    V311 {
        client: rumqttc::AsyncClient,
        deliveries: Arc<Mutex<HashMap<u16, rumqttc::Publish>>>,
        driver: JoinHandle<()>,
    },
    V5 {
        client: rumqttc::v5::AsyncClient,
        deliveries: Arc<Mutex<HashMap<u16, PublishV5>>>,
        driver: JoinHandle<()>,
    },
}

/// Native client that talks to a network broker through `rumqttc`
pub struct NetworkMqttClient {
    client_id: String,
    request_capacity: usize,
    events_tx: mpsc::UnboundedSender<MqttEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<MqttEvent>>>,
    session: Mutex<Option<Session>>,
    closing: Arc<AtomicBool>,
}

impl NetworkMqttClient {
    pub fn new(client_id: impl Into<String>, request_capacity: usize) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            client_id: client_id.into(),
            request_capacity,
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            session: Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    fn forwarder(&self) -> Forwarder {
        Forwarder {
            client_id: self.client_id.clone(),
            events: self.events_tx.clone(),
            closing: Arc::clone(&self.closing),
        }
    }

    fn not_connected(&self) -> MessagingError {
        MessagingError::ConnectionFailed {
            message: format!("client '{}' is not connected", self.client_id),
        }
    }

    async fn connect_v311(&self, options: &MqttConnectOptions) -> Result<Session, MessagingError> {
        let mut mqtt_options =
            rumqttc::MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
        mqtt_options
            .set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE))
            .set_clean_session(options.clean_session)
            .set_manual_acks(true);

        let (client, mut event_loop) = rumqttc::AsyncClient::new(mqtt_options, self.request_capacity);
        await_connack_v311(&mut event_loop).await?;

        let deliveries = Arc::new(Mutex::new(HashMap::new()));
        let driver = tokio::spawn(drive_v311(
            event_loop,
            self.forwarder(),
            Arc::clone(&deliveries),
        ));

        Ok(Session::V311 {
            client,
            deliveries,
            driver,
        })
    }

    async fn connect_v5(&self, options: &MqttConnectOptions) -> Result<Session, MessagingError> {
        let mut mqtt_options = rumqttc::v5::MqttOptions::new(
            options.client_id.clone(),
            options.host.clone(),
            options.port,
        );
        mqtt_options
            .set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE))
            .set_clean_start(options.clean_session)
            .set_manual_acks(true);

        let (client, mut event_loop) =
            rumqttc::v5::AsyncClient::new(mqtt_options, self.request_capacity);
        await_connack_v5(&mut event_loop).await?;

        let deliveries = Arc::new(Mutex::new(HashMap::new()));
        let driver = tokio::spawn(drive_v5(event_loop, self.forwarder(), Arc::clone(&deliveries)));

        Ok(Session::V5 {
            client,
            deliveries,
            driver,
        })
    }
}

#[async_trait]
impl MqttClient for NetworkMqttClient {
    async fn connect(&self, options: &MqttConnectOptions) -> Result<(), MessagingError> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        self.closing.store(false, Ordering::Release);
        let session = match options.protocol_version {
            ProtocolVersion::V500 => self.connect_v5(options).await?,
            ProtocolVersion::V310 | ProtocolVersion::V311 => self.connect_v311(options).await?,
        };
        *slot = Some(session);

        info!(
            client_id = %self.client_id,
            host = %options.host,
            port = options.port,
            protocol_version = ?options.protocol_version,
            "Connected to MQTT broker"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MessagingError> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        self.closing.store(true, Ordering::Release);

        let (requested, mut driver) = match session {
            Session::V311 { client, driver, .. } => (
                client.disconnect().await.map_err(|e| transport_error("disconnect", e)),
                driver,
            ),
            Session::V5 { client, driver, .. } => (
                client.disconnect().await.map_err(|e| transport_error("disconnect", e)),
                driver,
            ),
        };

        if tokio::time::timeout(DISCONNECT_GRACE, &mut driver).await.is_err() {
            driver.abort();
        }

        debug!(client_id = %self.client_id, "Disconnected from MQTT broker");
        requested
    }

    async fn subscribe(&self, topic: &str, qos: QualityOfService) -> Result<(), MessagingError> {
        match self.session.lock().await.as_ref() {
            Some(Session::V311 { client, .. }) => client
                .subscribe(topic, to_qos(qos))
                .await
                .map_err(|e| transport_error("subscribe", e)),
            Some(Session::V5 { client, .. }) => client
                .subscribe(topic, to_qos_v5(qos))
                .await
                .map_err(|e| transport_error("subscribe", e)),
            None => Err(self.not_connected()),
        }
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MessagingError> {
        match self.session.lock().await.as_ref() {
            Some(Session::V311 { client, .. }) => client
                .unsubscribe(topic)
                .await
                .map_err(|e| transport_error("unsubscribe", e)),
            Some(Session::V5 { client, .. }) => client
                .unsubscribe(topic)
                .await
                .map_err(|e| transport_error("unsubscribe", e)),
            None => Err(self.not_connected()),
        }
    }

    async fn publish(&self, publish: MqttPublish) -> Result<(), MessagingError> {
        let MqttPublish {
            topic,
            payload,
            qos,
            retain,
            user_properties,
        } = publish;

        match self.session.lock().await.as_ref() {
            Some(Session::V311 { client, .. }) => client
                .publish(topic, to_qos(qos), retain, payload.to_vec())
                .await
                .map_err(|e| transport_error("publish", e)),
            Some(Session::V5 { client, .. }) if user_properties.is_empty() => client
                .publish(topic, to_qos_v5(qos), retain, payload.to_vec())
                .await
                .map_err(|e| transport_error("publish", e)),
            Some(Session::V5 { client, .. }) => {
                let properties = PublishProperties {
                    user_properties,
                    ..Default::default()
                };
                client
                    .publish_with_properties(topic, to_qos_v5(qos), retain, payload.to_vec(), properties)
                    .await
                    .map_err(|e| transport_error("publish", e))
            }
            None => Err(self.not_connected()),
        }
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
        match self.session.lock().await.as_ref() {
            Some(Session::V311 {
                client, deliveries, ..
            }) => {
                let Some(publish) = deliveries.lock().await.remove(&packet_id) else {
                    return Ok(());
                };
                if let Err(e) = client.ack(&publish).await {
                    deliveries.lock().await.insert(packet_id, publish);
                    return Err(transport_error("acknowledge", e));
                }
                Ok(())
            }
            Some(Session::V5 {
                client, deliveries, ..
            }) => {
                let Some(publish) = deliveries.lock().await.remove(&packet_id) else {
                    return Ok(());
                };
                if let Err(e) = client.ack(&publish).await {
                    deliveries.lock().await.insert(packet_id, publish);
                    return Err(transport_error("acknowledge", e));
                }
                Ok(())
            }
            None => Err(self.not_connected()),
        }
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }
}

// ============================================================================
// NetworkMqttClientFactory
// ============================================================================

/// Creates [`NetworkMqttClient`]s for the MQTT adapters
#[derive(Debug, Clone)]
pub struct NetworkMqttClientFactory {
    request_capacity: usize,
}

impl NetworkMqttClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound on queued outgoing requests per connection
    pub fn with_request_capacity(mut self, request_capacity: usize) -> Self {
        self.request_capacity = request_capacity.max(1);
        self
    }

    pub fn request_capacity(&self) -> usize {
        self.request_capacity
    }
}

impl Default for NetworkMqttClientFactory {
    fn default() -> Self {
        Self {
            request_capacity: DEFAULT_REQUEST_CAPACITY,
        }
    }
}

impl MqttClientFactory for NetworkMqttClientFactory {
    fn create_client(&self, client_id: &str) -> Arc<dyn MqttClient> {
        Arc::new(NetworkMqttClient::new(client_id, self.request_capacity))
    }
}
