//! Integration tests for publishing and receiving over MQTT
//!
//! These tests run an `MqttPublisher` and an `MqttReceiver` under the retry
//! loop against the in-process broker.

mod common;

use bytes::Bytes;
use common::{
    connect_publisher, fast_retry_policy, init_tracing, mqtt_config, spawn_listener,
    start_mqtt_listener, wait_for_subscriber, wait_until, RecordingHandler, TOPIC,
};
use messaging_runtime::{
    envelopes, message_handler, typed_handler, InMemoryMqttBroker, Message, MessagePublisher,
    MessageReceiver, MqttReceiver, PropertyValue, ProtocolVersion, PublisherExt,
    QualityOfService, ReceiverExt, TypedMessage,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: String,
    lines: Vec<OrderLine>,
    express: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderLine {
    sku: String,
    quantity: u32,
}

/// Verify the reference scenario: ten envelopes carrying a property and
/// identical random content are all collected.
#[tokio::test]
async fn test_ten_messages_with_property_are_collected() {
    init_tracing();

    // Arrange
    let broker = Arc::new(InMemoryMqttBroker::new());
    let config = mqtt_config(ProtocolVersion::V500, QualityOfService::AtMostOnce);
    let recorder = RecordingHandler::new();
    let cancel = CancellationToken::new();
    let (_receiver, task) =
        start_mqtt_listener(&broker, config.clone(), recorder.handler(), cancel.clone()).await;

    let mut content = [0u8; 16];
    rand::thread_rng().fill(&mut content);
    let messages: Vec<Message> = (0..10)
        .map(|_| Message::new(content.to_vec()).with_property("x-my-property", "hello"))
        .collect();

    // Act
    let publisher = connect_publisher(&broker, config).await;
    publisher
        .publish(messages, &CancellationToken::new())
        .await
        .expect("publish should succeed");

    let collected = wait_until(Duration::from_secs(120), || {
        let recorder = recorder.clone();
        async move { recorder.message_count() >= 10 }
    })
    .await;

    cancel.cancel();
    let result = task.await.expect("listener task should not panic");

    // Assert
    assert!(collected, "all ten messages should arrive within 120 seconds");
    assert!(result.is_ok());

    let received = recorder.received();
    assert_eq!(received.len(), 10);
    for message in &received {
        assert_eq!(message.content(), &Bytes::copy_from_slice(&content));
        assert_eq!(
            message.property("x-my-property"),
            Some(&PropertyValue::from("hello"))
        );
    }
}

/// Verify that N distinct markers all arrive at least once.
#[tokio::test]
async fn test_every_distinct_marker_is_received() {
    let broker = Arc::new(InMemoryMqttBroker::new());
    let config = mqtt_config(ProtocolVersion::V311, QualityOfService::AtLeastOnce);
    let recorder = RecordingHandler::new();
    let cancel = CancellationToken::new();
    let (_receiver, task) =
        start_mqtt_listener(&broker, config.clone(), recorder.handler(), cancel.clone()).await;

    let markers: Vec<String> = (0..25).map(|i| format!("marker-{}", i)).collect();
    let publisher = connect_publisher(&broker, config).await;
    publisher
        .publish(
            markers.iter().map(|m| Message::new(m.clone())).collect(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let collected = wait_until(Duration::from_secs(10), || {
        let recorder = recorder.clone();
        async move { recorder.message_count() >= 25 }
    })
    .await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    assert!(collected);
    let received: Vec<String> = recorder
        .received()
        .iter()
        .map(|m| m.content_str().unwrap().to_string())
        .collect();
    for marker in &markers {
        assert!(received.contains(marker), "missing {}", marker);
    }
}

/// Verify that properties are dropped without error below protocol version 5.
#[tokio::test]
async fn test_properties_absent_over_v311() {
    let broker = Arc::new(InMemoryMqttBroker::new());
    let config = mqtt_config(ProtocolVersion::V311, QualityOfService::AtMostOnce);
    let recorder = RecordingHandler::new();
    let cancel = CancellationToken::new();
    let (_receiver, task) =
        start_mqtt_listener(&broker, config.clone(), recorder.handler(), cancel.clone()).await;

    let publisher = connect_publisher(&broker, config).await;
    publisher
        .publish(
            vec![Message::new("payload").with_property("x-my-property", "hello")],
            &CancellationToken::new(),
        )
        .await
        .expect("publishing properties over 3.1.1 should not fail");

    let collected = wait_until(Duration::from_secs(10), || {
        let recorder = recorder.clone();
        async move { recorder.message_count() >= 1 }
    })
    .await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    assert!(collected);
    let received = recorder.received();
    assert!(received[0].properties().is_empty());
    assert_eq!(received[0].content_str().unwrap(), "payload");
}

/// Verify that an object published as JSON is received deep-equal.
#[tokio::test]
async fn test_json_round_trip() {
    // Arrange
    let broker = Arc::new(InMemoryMqttBroker::new());
    let config = mqtt_config(ProtocolVersion::V500, QualityOfService::AtLeastOnce);
    let receiver = Arc::new(MqttReceiver::new(config.clone(), broker.clone()).unwrap());
    let cancel = CancellationToken::new();
    let objects = Arc::new(Mutex::new(Vec::new()));

    let handler = {
        let receiver = Arc::clone(&receiver);
        let objects = Arc::clone(&objects);
        typed_handler(move |messages: Vec<TypedMessage<OrderPlaced>>, cancel| {
            let receiver = Arc::clone(&receiver);
            let objects = Arc::clone(&objects);
            async move {
                receiver.confirm(&envelopes(&messages), &cancel).await?;
                for message in messages {
                    let (_, object) = message.into_parts();
                    objects.lock().unwrap().push(object);
                }
                Ok(())
            }
        })
    };

    let task = {
        let receiver = Arc::clone(&receiver);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            receiver
                .listen_and_deserialize_json(handler, &fast_retry_policy(), cancel)
                .await
        })
    };
    wait_for_subscriber(&broker).await;

    let order = OrderPlaced {
        order_id: "ORD-1001".to_string(),
        lines: vec![
            OrderLine {
                sku: "widget".to_string(),
                quantity: 3,
            },
            OrderLine {
                sku: "gadget".to_string(),
                quantity: 1,
            },
        ],
        express: true,
    };

    // Act
    let publisher = connect_publisher(&broker, config).await;
    publisher
        .publish_as_json(&[order.clone()], &CancellationToken::new())
        .await
        .unwrap();

    let collected = wait_until(Duration::from_secs(10), || {
        let objects = Arc::clone(&objects);
        async move { !objects.lock().unwrap().is_empty() }
    })
    .await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    // Assert
    assert!(collected);
    assert_eq!(*objects.lock().unwrap(), vec![Some(order)]);
    assert_eq!(broker.acknowledgement_count().await, 1);
}

/// Verify that confirming the same envelope twice acknowledges it once.
#[tokio::test]
async fn test_double_confirm_acknowledges_once() {
    let broker = Arc::new(InMemoryMqttBroker::new());
    let config = mqtt_config(ProtocolVersion::V311, QualityOfService::AtLeastOnce);
    let receiver = Arc::new(MqttReceiver::new(config.clone(), broker.clone()).unwrap());
    let cancel = CancellationToken::new();
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let handler = {
        let receiver = Arc::clone(&receiver);
        let outcomes = Arc::clone(&outcomes);
        message_handler(move |messages, cancel| {
            let receiver = Arc::clone(&receiver);
            let outcomes = Arc::clone(&outcomes);
            async move {
                let first = receiver.confirm(&messages, &cancel).await.is_ok();
                let second = receiver.confirm(&messages, &cancel).await.is_ok();
                outcomes.lock().unwrap().push((first, second));
                Ok(())
            }
        })
    };
    let task = spawn_listener(
        Arc::clone(&receiver),
        handler,
        fast_retry_policy(),
        cancel.clone(),
    );
    wait_for_subscriber(&broker).await;

    let publisher = connect_publisher(&broker, config).await;
    publisher
        .publish(vec![Message::new("once")], &CancellationToken::new())
        .await
        .unwrap();

    let handled = wait_until(Duration::from_secs(10), || {
        let outcomes = Arc::clone(&outcomes);
        async move { !outcomes.lock().unwrap().is_empty() }
    })
    .await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    assert!(handled);
    assert_eq!(*outcomes.lock().unwrap(), vec![(true, true)]);
    assert_eq!(broker.acknowledgement_count().await, 1);
    assert_eq!(broker.unacknowledged_count().await, 0);
}

/// Verify that retained messages reach a receiver that subscribes later.
#[tokio::test]
async fn test_retained_message_reaches_late_receiver() {
    let broker = Arc::new(InMemoryMqttBroker::new());
    let config = mqtt_config(ProtocolVersion::V311, QualityOfService::AtMostOnce)
        .with_retain_message(true);

    let publisher = connect_publisher(&broker, config.clone()).await;
    publisher
        .publish(vec![Message::new("last known state")], &CancellationToken::new())
        .await
        .unwrap();
    publisher.close().await.unwrap();

    let recorder = RecordingHandler::new();
    let cancel = CancellationToken::new();
    let (_receiver, task) =
        start_mqtt_listener(&broker, config, recorder.handler(), cancel.clone()).await;

    let collected = wait_until(Duration::from_secs(10), || {
        let recorder = recorder.clone();
        async move { recorder.message_count() >= 1 }
    })
    .await;
    cancel.cancel();
    task.await.unwrap().unwrap();

    assert!(collected);
    assert_eq!(
        recorder.received()[0].content_str().unwrap(),
        "last known state"
    );
    assert_eq!(
        broker.retained_payload(TOPIC).await,
        Some(Bytes::from_static(b"last known state"))
    );
}
