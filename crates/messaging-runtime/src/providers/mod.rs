//! Transport adapters.
//!
//! Each adapter implements the `MessagePublisher` and `MessageReceiver`
//! traits for one transport and reports the optional operations it supports
//! through `MessageReceiver::capabilities`.

pub mod memory;
pub mod mqtt;
pub mod mqtt_broker;
pub mod mqtt_network;

pub use memory::InMemoryQueue;
pub use mqtt::{
    MqttClient, MqttClientFactory, MqttConnectOptions, MqttDelivery, MqttEvent, MqttPublish,
    MqttPublisher, MqttReceiver,
};
pub use mqtt_broker::{InMemoryMqttBroker, InMemoryMqttClient};
pub use mqtt_network::{NetworkMqttClient, NetworkMqttClientFactory};
