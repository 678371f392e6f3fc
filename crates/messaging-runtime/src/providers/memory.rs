//! In-memory queue adapter for testing and development.
//!
//! This module provides a queue with the full receiver capability set:
//! - Visibility locks on delivered messages, released by confirm
//! - Redelivery after reject or lock expiry
//! - Lock extension through keep-alive
//! - Dead-lettering, explicit or after too many deliveries
//! - Message counts
//!
//! One [`InMemoryQueue`] is both publisher and receiver. Clones share the
//! same storage, so a clone can publish while another listens.

use crate::client::{
    invoke_handler, ListenGuard, ListenState, MessageHandler, MessagePublisher, MessageReceiver,
};
use crate::error::MessagingError;
use crate::message::{Message, MessageId, Timestamp};
use crate::provider::{Capabilities, InMemoryConfig, ProviderType};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Property set on dead-lettered messages with the caller's reason
pub const DEAD_LETTER_REASON_PROPERTY: &str = "dead-letter-reason";

/// Property set on dead-lettered messages with the error description
pub const DEAD_LETTER_DESCRIPTION_PROPERTY: &str = "dead-letter-description";

/// Property set on dead-lettered messages with the time they were moved
pub const DEAD_LETTERED_AT_PROPERTY: &str = "dead-lettered-at";

/// Property carrying the number of deliveries a message has had
pub const DELIVERY_COUNT_PROPERTY: &str = "delivery-count";

/// Lock deadline used when a requested duration cannot be represented
const MAX_LOCK_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// `duration` after `now`, capped at [`MAX_LOCK_DURATION`]
fn lock_deadline(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration.min(MAX_LOCK_DURATION))
        .unwrap_or(now)
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A message waiting in the queue
struct StoredMessage {
    message: Message,
    delivery_count: u32,
}

/// A delivered message awaiting confirm or reject
struct InFlightMessage {
    stored: StoredMessage,
    lock_expires_at: Instant,
}

struct QueueStorage {
    /// Main message queue (FIFO order)
    messages: VecDeque<StoredMessage>,
    in_flight: HashMap<MessageId, InFlightMessage>,
    dead_letter: VecDeque<Message>,
    config: InMemoryConfig,
}

impl QueueStorage {
    fn new(config: InMemoryConfig) -> Self {
        Self {
            messages: VecDeque::new(),
            in_flight: HashMap::new(),
            dead_letter: VecDeque::new(),
            config,
        }
    }

    fn exceeded_delivery_limit(&self, stored: &StoredMessage) -> bool {
        self.config.max_delivery_count != 0
            && stored.delivery_count >= self.config.max_delivery_count
    }

    /// Return a message to the queue, or dead-letter it if it has been delivered too often
    fn requeue(&mut self, stored: StoredMessage, cause: &str) {
        if !self.exceeded_delivery_limit(&stored) {
            self.messages.push_back(stored);
            return;
        }

        let description = format!(
            "delivered {} times without being confirmed",
            stored.delivery_count
        );
        if self.config.enable_dead_letter_queue {
            self.move_to_dead_letter(stored.message, "max-delivery-count-exceeded", &description);
        } else {
            warn!(
                message_id = %stored.message.id(),
                delivery_count = stored.delivery_count,
                cause,
                "Discarding message that exceeded the delivery limit"
            );
        }
    }

    fn move_to_dead_letter(&mut self, message: Message, reason: &str, description: &str) {
        debug!(message_id = %message.id(), reason, "Message dead-lettered");

        let message = message
            .with_property(DEAD_LETTER_REASON_PROPERTY, reason)
            .with_property(DEAD_LETTER_DESCRIPTION_PROPERTY, description)
            .with_property(DEAD_LETTERED_AT_PROPERTY, Timestamp::now().to_string());
        self.dead_letter.push_back(message);
    }

    /// Requeue in-flight messages whose lock has lapsed
    fn release_expired_locks(&mut self, now: Instant) {
        let expired: Vec<MessageId> = self
            .in_flight
            .iter()
            .filter(|(_, in_flight)| now >= in_flight.lock_expires_at)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(in_flight) = self.in_flight.remove(&id) {
                debug!(message_id = %id, "Message lock expired");
                self.requeue(in_flight.stored, "lock expired");
            }
        }
    }

    /// Move up to `max_batch_size` messages in flight and return copies for the handler
    fn take_batch(&mut self, now: Instant) -> Vec<Message> {
        let lock_expires_at = lock_deadline(now, self.config.lock_duration());
        let count = self.messages.len().min(self.config.max_batch_size);
        let mut batch = Vec::with_capacity(count);

        for mut stored in self.messages.drain(..count) {
            stored.delivery_count += 1;
            let delivered = stored
                .message
                .clone()
                .with_property(DELIVERY_COUNT_PROPERTY, stored.delivery_count);

            self.in_flight.insert(
                delivered.id().clone(),
                InFlightMessage {
                    stored,
                    lock_expires_at,
                },
            );
            batch.push(delivered);
        }

        batch
    }
}

// ============================================================================
// InMemoryQueue
// ============================================================================

/// In-memory queue usable as both publisher and receiver
#[derive(Clone)]
pub struct InMemoryQueue {
    storage: Arc<Mutex<QueueStorage>>,
    config: InMemoryConfig,
    available: Arc<Notify>,
    listening: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    state: Arc<watch::Sender<ListenState>>,
}

impl InMemoryQueue {
    /// Create new in-memory queue with configuration
    pub fn new(config: InMemoryConfig) -> Result<Self, MessagingError> {
        config.validate()?;
        Ok(Self::with_validated_config(config))
    }

    fn with_validated_config(config: InMemoryConfig) -> Self {
        let (state, _) = watch::channel(ListenState::Disconnected);

        Self {
            storage: Arc::new(Mutex::new(QueueStorage::new(config.clone()))),
            config,
            available: Arc::new(Notify::new()),
            listening: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
            state: Arc::new(state),
        }
    }

    pub fn config(&self) -> &InMemoryConfig {
        &self.config
    }

    /// Current phase of the listen state machine
    pub fn state(&self) -> ListenState {
        *self.state.borrow()
    }

    /// Messages delivered and not yet confirmed, rejected or expired
    pub async fn in_flight_count(&self) -> usize {
        self.storage.lock().await.in_flight.len()
    }

    /// Snapshot of the dead-letter queue, oldest first
    pub async fn dead_letter_messages(&self) -> Vec<Message> {
        self.storage
            .lock()
            .await
            .dead_letter
            .iter()
            .cloned()
            .collect()
    }

    fn transition(&self, next: ListenState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Listen state changed");
        }
    }

    async fn next_batch(&self) -> Vec<Message> {
        let mut storage = self.storage.lock().await;
        let now = Instant::now();
        storage.release_expired_locks(now);
        storage.take_batch(now)
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
            batch_size = messages.len(),
            error = %e,
            "Message handler failed; rejecting batch"
        );

        if cancel.is_cancelled() {
            return;
        }

        if let Err(e) = self.reject(&messages, cancel).await {
            warn!(error = %e, "Failed to reject batch");
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::with_validated_config(InMemoryConfig::default())
    }
}

#[async_trait]
impl MessagePublisher for InMemoryQueue {
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

        for message in messages {
            if cancel.is_cancelled() {
                debug!("Publish cancelled; skipping remaining messages");
                break;
            }

            let mut storage = self.storage.lock().await;
            if storage.messages.len() + storage.in_flight.len() >= self.config.max_queue_size {
                return Err(MessagingError::QueueFull {
                    max_size: self.config.max_queue_size,
                });
            }

            // The queue assigns its own identifiers
            let message = message.with_id(MessageId::new());
            debug!(message_id = %message.id(), "Message enqueued");
            storage.messages.push_back(StoredMessage {
                message,
                delivery_count: 0,
            });
            drop(storage);

            self.available.notify_one();
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}

#[async_trait]
impl MessageReceiver for InMemoryQueue {
    async fn listen(
        &self,
        handler: MessageHandler,
        cancel: CancellationToken,
    ) -> Result<(), MessagingError> {
        let _guard = ListenGuard::acquire(&self.listening)?;

        self.transition(ListenState::Connecting);
        self.transition(ListenState::Subscribed);
        info!(
            max_batch_size = self.config.max_batch_size,
            "In-memory receiver listening"
        );

        loop {
            self.transition(ListenState::Idle);
            if cancel.is_cancelled() {
                break;
            }

            let batch = self.next_batch().await;
            if !batch.is_empty() {
                self.transition(ListenState::Delivering);
                self.deliver(&handler, batch, &cancel).await;
                continue;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.available.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        self.transition(ListenState::Unsubscribing);
        info!("In-memory receiver stopped");
        self.transition(ListenState::Disconnected);
        Ok(())
    }

    async fn confirm(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<(), MessagingError> {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let mut storage = self.storage.lock().await;
        for message in messages {
            if storage.in_flight.remove(message.id()).is_some() {
                debug!(message_id = %message.id(), "Message confirmed");
            }
        }

        Ok(())
    }

    async fn reject(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<(), MessagingError> {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let mut storage = self.storage.lock().await;
        let mut requeued = false;
        for message in messages {
            if let Some(in_flight) = storage.in_flight.remove(message.id()) {
                debug!(message_id = %message.id(), "Message rejected");
                storage.requeue(in_flight.stored, "rejected");
                requeued = true;
            }
        }
        drop(storage);

        if requeued {
            self.available.notify_one();
        }

        Ok(())
    }

    async fn keep_alive(
        &self,
        messages: &[Message],
        time_to_live: Option<Duration>,
    ) -> Result<(), MessagingError> {
        let lock_expires_at = lock_deadline(
            Instant::now(),
            time_to_live.unwrap_or(self.config.lock_duration()),
        );

        let mut storage = self.storage.lock().await;
        for message in messages {
            if let Some(in_flight) = storage.in_flight.get_mut(message.id()) {
                in_flight.lock_expires_at = lock_expires_at;
            }
        }

        Ok(())
    }

    async fn dead_letter(
        &self,
        messages: &[Message],
        reason: &str,
        error_description: &str,
        cancel: &CancellationToken,
    ) -> Result<(), MessagingError> {
        if !self.config.enable_dead_letter_queue {
            return Err(MessagingError::not_supported(
                "dead_letter",
                ProviderType::InMemory,
            ));
        }

        if cancel.is_cancelled() {
            return Ok(());
        }

        let mut storage = self.storage.lock().await;
        for message in messages {
            if let Some(in_flight) = storage.in_flight.remove(message.id()) {
                storage.move_to_dead_letter(in_flight.stored.message, reason, error_description);
            }
        }

        Ok(())
    }

    async fn message_count(&self, _cancel: &CancellationToken) -> Result<u64, MessagingError> {
        Ok(self.storage.lock().await.messages.len() as u64)
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            dead_letter: self.config.enable_dead_letter_queue,
            ..Capabilities::all()
        }
    }
}
