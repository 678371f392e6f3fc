//! Tests for the messaging-runtime library module.

use super::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[test]
fn test_root_exports_cover_both_adapters() {
    let broker = Arc::new(InMemoryMqttBroker::new());
    let receiver = MqttReceiver::new(MqttConfig::new("localhost", "orders/#"), broker).unwrap();
    let queue = InMemoryQueue::default();

    assert_eq!(receiver.provider_type(), ProviderType::Mqtt);
    assert_eq!(MessageReceiver::provider_type(&queue), ProviderType::InMemory);
    assert_eq!(receiver.state(), ListenState::Disconnected);
}

#[test]
fn test_boxed_receivers_are_object_safe() {
    let broker = Arc::new(InMemoryMqttBroker::new());
    let receivers: Vec<Box<dyn MessageReceiver>> = vec![
        Box::new(MqttReceiver::new(MqttConfig::new("localhost", "orders"), broker).unwrap()),
        Box::new(InMemoryQueue::default()),
    ];

    let capabilities: Vec<Capabilities> = receivers.iter().map(|r| r.capabilities()).collect();
    assert!(!capabilities[0].dead_letter);
    assert!(capabilities[1].dead_letter);
}

/// Verify the JSON round trip through the public API only.
#[tokio::test]
async fn test_json_round_trip_through_in_memory_queue() {
    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Greeting {
        text: String,
    }

    // Arrange
    let queue = InMemoryQueue::default();
    let cancel = CancellationToken::new();
    let received = Arc::new(tokio::sync::Mutex::new(Vec::new()));

    queue
        .publish_as_json(
            &[Greeting {
                text: "hello".to_string(),
            }],
            &cancel,
        )
        .await
        .unwrap();

    let handler = {
        let received = Arc::clone(&received);
        let stop = cancel.clone();
        typed_handler(move |messages: Vec<TypedMessage<Greeting>>, _token| {
            let received = Arc::clone(&received);
            let stop = stop.clone();
            async move {
                for message in messages {
                    let (_, object) = message.into_parts();
                    received.lock().await.push(object);
                }
                stop.cancel();
                Ok(())
            }
        })
    };

    // Act
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        queue.listen_and_deserialize_json(handler, &RetryPolicy::default(), cancel),
    )
    .await
    .expect("listen should stop after the first batch");

    // Assert
    assert!(result.is_ok());
    assert_eq!(
        *received.lock().await,
        vec![Some(Greeting {
            text: "hello".to_string()
        })]
    );
}
