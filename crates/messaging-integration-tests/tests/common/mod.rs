//! Common test utilities for messaging-runtime integration tests
//!
//! This module provides:
//! - One-time tracing setup controlled by `RUST_LOG`
//! - A recording handler that can be told to fail
//! - Broker and receiver fixtures plus polling helpers

use messaging_runtime::{
    message_handler, InMemoryMqttBroker, Message, MessageHandler, MessageReceiver, MqttConfig,
    MqttPublisher, MqttReceiver, ProtocolVersion, QualityOfService, ReceiverExt, RetryPolicy,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static TRACING: Once = Once::new();

/// Install a test subscriber once per test binary
#[allow(dead_code)]
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "messaging_runtime=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}

// ============================================================================
// Recording Handler
// ============================================================================

/// Handler double that records every batch it receives
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct RecordingHandler {
    received: Arc<Mutex<Vec<Message>>>,
    batches: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

#[allow(dead_code)]
impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler that fails every batch after recording it
    pub fn failing() -> Self {
        let handler = Self::default();
        handler.fail.store(true, Ordering::SeqCst);
        handler
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn handler(&self) -> MessageHandler {
        let recorder = self.clone();
        message_handler(move |messages, _cancel| {
            let recorder = recorder.clone();
            async move {
                recorder.batches.fetch_add(1, Ordering::SeqCst);
                recorder.received.lock().unwrap().extend(messages);

                if recorder.fail.load(Ordering::SeqCst) {
                    anyhow::bail!("handler configured to fail");
                }
                Ok(())
            }
        })
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }

    pub fn message_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Fixtures
// ============================================================================

#[allow(dead_code)]
pub const TOPIC: &str = "integration/orders";

/// MQTT configuration for the in-memory broker
#[allow(dead_code)]
pub fn mqtt_config(protocol_version: ProtocolVersion, qos: QualityOfService) -> MqttConfig {
    MqttConfig::new("localhost", TOPIC)
        .with_protocol_version(protocol_version)
        .with_quality_of_service(qos)
}

/// Retry policy with short, deterministic delays
#[allow(dead_code)]
pub fn fast_retry_policy() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(50), 2.0).without_jitter()
}

/// Connect a publisher to the broker
#[allow(dead_code)]
pub async fn connect_publisher(broker: &Arc<InMemoryMqttBroker>, config: MqttConfig) -> MqttPublisher {
    MqttPublisher::connect(config, broker.clone())
        .await
        .expect("Setup: publisher should connect")
}

/// Start `receiver.listen_with_retry` on a background task
#[allow(dead_code)]
pub fn spawn_listener<R>(
    receiver: Arc<R>,
    handler: MessageHandler,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> JoinHandle<Result<(), messaging_runtime::MessagingError>>
where
    R: MessageReceiver + 'static,
{
    tokio::spawn(async move { receiver.listen_with_retry(handler, &policy, cancel).await })
}

/// Create an MQTT receiver and start it listening with retry
#[allow(dead_code)]
pub async fn start_mqtt_listener(
    broker: &Arc<InMemoryMqttBroker>,
    config: MqttConfig,
    handler: MessageHandler,
    cancel: CancellationToken,
) -> (
    Arc<MqttReceiver>,
    JoinHandle<Result<(), messaging_runtime::MessagingError>>,
) {
    let receiver = Arc::new(
        MqttReceiver::new(config, broker.clone()).expect("Setup: receiver config should be valid"),
    );
    let task = spawn_listener(
        Arc::clone(&receiver),
        handler,
        fast_retry_policy(),
        cancel,
    );
    wait_for_subscriber(broker).await;
    (receiver, task)
}

/// Poll `condition` until it holds or `timeout` elapses
#[allow(dead_code)]
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(timeout, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

/// Wait until a receiver is subscribed to [`TOPIC`]
#[allow(dead_code)]
pub async fn wait_for_subscriber(broker: &Arc<InMemoryMqttBroker>) {
    let subscribed = wait_until(Duration::from_secs(5), || {
        let broker = Arc::clone(broker);
        async move { broker.subscriber_count(TOPIC).await > 0 }
    })
    .await;
    assert!(subscribed, "receiver should subscribe to {}", TOPIC);
}
