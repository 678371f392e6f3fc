//! Tests for provider types and configuration.

use super::*;
use serial_test::serial;
use std::io::Write;

#[test]
fn test_provider_capabilities() {
    let mqtt = ProviderType::Mqtt.capabilities();
    assert!(!mqtt.dead_letter);
    assert!(!mqtt.message_count);
    assert!(!mqtt.keep_alive);

    assert_eq!(ProviderType::InMemory.capabilities(), Capabilities::all());
}

#[test]
fn test_quality_of_service_acknowledgement() {
    assert!(!QualityOfService::AtMostOnce.requires_acknowledgement());
    assert!(QualityOfService::AtLeastOnce.requires_acknowledgement());
    assert!(QualityOfService::ExactlyOnce.requires_acknowledgement());
}

#[test]
fn test_protocol_version_user_properties() {
    assert!(!ProtocolVersion::V310.supports_user_properties());
    assert!(!ProtocolVersion::V311.supports_user_properties());
    assert!(ProtocolVersion::V500.supports_user_properties());
}

#[test]
fn test_mqtt_config_defaults() {
    let config = MqttConfig::new("localhost", "orders");

    assert_eq!(config.quality_of_service, QualityOfService::AtMostOnce);
    assert!(!config.retain_message);
    assert_eq!(config.protocol_version, ProtocolVersion::V311);
    assert_eq!(config.effective_port(), DEFAULT_MQTT_PORT);
    assert_eq!(config.with_port(8883).effective_port(), 8883);
}

#[test]
fn test_mqtt_config_validation() {
    assert!(MqttConfig::new("localhost", "orders").validate().is_ok());
    assert!(MqttConfig::new("localhost", "sensors/+/temperature")
        .validate()
        .is_ok());

    assert!(matches!(
        MqttConfig::new("", "orders").validate(),
        Err(ConfigurationError::Missing { key }) if key == "address"
    ));
    assert!(matches!(
        MqttConfig::new("localhost", "").validate(),
        Err(ConfigurationError::Missing { key }) if key == "topic"
    ));
    assert!(matches!(
        MqttConfig::new("localhost", "orders").with_port(0).validate(),
        Err(ConfigurationError::Invalid { .. })
    ));
}

#[test]
fn test_in_memory_config_defaults() {
    let config = InMemoryConfig::default();
    assert_eq!(config.max_batch_size, 10);
    assert_eq!(config.lock_duration(), Duration::from_secs(30));
    assert_eq!(config.max_delivery_count, 3);
    assert!(config.enable_dead_letter_queue);
    assert!(config.validate().is_ok());
}

#[test]
fn test_in_memory_config_rejects_zero_batch() {
    let config = InMemoryConfig {
        max_batch_size: 0,
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

#[test]
#[serial]
fn test_mqtt_config_load_from_yaml_file() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(
        file,
        "address: broker.local\nport: 1884\ntopic: /lol\nquality_of_service: at_least_once\nprotocol_version: \"5.0.0\"\nretain_message: true"
    )
    .unwrap();

    let config = MqttConfig::load(Some(file.path())).unwrap();

    assert_eq!(config.address, "broker.local");
    assert_eq!(config.effective_port(), 1884);
    assert_eq!(config.topic, "/lol");
    assert_eq!(config.quality_of_service, QualityOfService::AtLeastOnce);
    assert_eq!(config.protocol_version, ProtocolVersion::V500);
    assert!(config.retain_message);
    assert_eq!(config.client_id_prefix, "messaging");
}

#[test]
#[serial]
fn test_mqtt_config_load_rejects_incomplete_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "topic = \"orders\"").unwrap();

    let result = MqttConfig::load(Some(file.path()));

    assert!(matches!(result, Err(ConfigurationError::Missing { key }) if key == "address"));
}

#[test]
#[serial]
fn test_mqtt_config_load_reports_parse_errors() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    writeln!(file, "{{ \"address\": ").unwrap();

    let result = MqttConfig::load(Some(file.path()));

    assert!(matches!(result, Err(ConfigurationError::Parsing { .. })));
}

#[test]
#[serial]
fn test_environment_overrides_config_file() {
    // Arrange
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "address = \"file.local\"\ntopic = \"from/file\"").unwrap();
    std::env::set_var("MESSAGING__TOPIC", "from/environment");
    std::env::set_var("MESSAGING__CLIENT_ID_PREFIX", "worker");

    // Act
    let result = MqttConfig::load(Some(file.path()));

    // Cleanup
    std::env::remove_var("MESSAGING__TOPIC");
    std::env::remove_var("MESSAGING__CLIENT_ID_PREFIX");

    // Assert
    let config = result.unwrap();
    assert_eq!(config.address, "file.local");
    assert_eq!(config.topic, "from/environment");
    assert_eq!(config.client_id_prefix, "worker");
}

#[test]
#[serial]
fn test_environment_alone_configures_in_memory_queue() {
    std::env::set_var("MESSAGING__MAX_BATCH_SIZE", "25");

    let result = InMemoryConfig::load(None);

    std::env::remove_var("MESSAGING__MAX_BATCH_SIZE");

    let config = result.unwrap();
    assert_eq!(config.max_batch_size, 25);
    assert_eq!(config.lock_duration_seconds, InMemoryConfig::default().lock_duration_seconds);
}
