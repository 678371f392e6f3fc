//! Publisher and receiver contracts shared by all transport adapters.

use crate::error::MessagingError;
use crate::message::{Message, TypedMessage};
use crate::provider::{Capabilities, ProviderType};
use crate::retry::{self, RetryPolicy};
use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

// ============================================================================
// Handlers
// ============================================================================

/// Failure raised by a message handler. Never propagated past the adapter.
pub type HandlerError = anyhow::Error;

/// Future returned by a handler invocation
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

/// Callback invoked with each delivered batch and the ambient cancellation token
pub type Handler<M> = Arc<dyn Fn(Vec<M>, CancellationToken) -> HandlerFuture + Send + Sync>;

/// Handler over raw envelopes
pub type MessageHandler = Handler<Message>;

/// Handler over JSON-deserialized envelopes
pub type TypedHandler<T> = Handler<TypedMessage<T>>;

/// Box an async closure into a [`Handler`]
pub fn handler<M, F, Fut>(f: F) -> Handler<M>
where
    M: 'static,
    F: Fn(Vec<M>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(
        move |messages: Vec<M>, cancel: CancellationToken| -> HandlerFuture {
            Box::pin(f(messages, cancel))
        },
    )
}

/// Box an async closure into a [`MessageHandler`]
///
/// ```rust
/// use messaging_runtime::message_handler;
///
/// let handler = message_handler(|messages, _cancel| async move {
///     for message in messages {
///         println!("received {}", message.id());
///     }
///     Ok(())
/// });
/// # drop(handler);
/// ```
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Vec<Message>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    handler(f)
}

/// Box an async closure into a [`TypedHandler`]
pub fn typed_handler<T, F, Fut>(f: F) -> TypedHandler<T>
where
    T: 'static,
    F: Fn(Vec<TypedMessage<T>>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    handler(f)
}

/// Adapt a typed handler to raw envelopes by deserializing each one.
///
/// Deserialization failures leave the typed object empty and never abort the batch.
pub fn json_handler<T>(typed: TypedHandler<T>) -> MessageHandler
where
    T: DeserializeOwned + Send + 'static,
{
    Arc::new(move |messages: Vec<Message>, cancel: CancellationToken| -> HandlerFuture {
        let batch = messages
            .into_iter()
            .map(TypedMessage::<T>::from_message)
            .collect();
        typed(batch, cancel)
    })
}

/// Run `handler` on a batch, reporting a panic as a handler error
pub(crate) async fn invoke_handler(
    handler: &MessageHandler,
    messages: Vec<Message>,
    cancel: CancellationToken,
) -> Result<(), HandlerError> {
    let future = match panic::catch_unwind(AssertUnwindSafe(|| handler(messages, cancel))) {
        Ok(future) => future,
        Err(payload) => return Err(panic_error(payload)),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(panic_error(payload)),
    }
}

fn panic_error(payload: Box<dyn Any + Send>) -> HandlerError {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    anyhow::anyhow!("message handler panicked: {}", detail)
}

// ============================================================================
// Listen State
// ============================================================================

/// Phase of an adapter's listen pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenState {
    Disconnected,
    Connecting,
    Subscribed,
    Delivering,
    Idle,
    Unsubscribing,
}

impl std::fmt::Display for ListenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Delivering => "delivering",
            Self::Idle => "idle",
            Self::Unsubscribing => "unsubscribing",
        };
        write!(f, "{}", name)
    }
}

/// Marks a receiver as listening for as long as the guard lives
pub(crate) struct ListenGuard<'a> {
    active: &'a AtomicBool,
}

impl<'a> ListenGuard<'a> {
    /// Claim the receiver, failing with `ListenerActive` if another listen owns it
    pub(crate) fn acquire(active: &'a AtomicBool) -> Result<Self, MessagingError> {
        if active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MessagingError::ListenerActive);
        }

        Ok(Self { active })
    }
}

impl Drop for ListenGuard<'_> {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

// ============================================================================
// Publisher Contract
// ============================================================================

/// Sends envelopes to the destination configured on the adapter
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Send envelopes in order, one transport send per envelope.
    ///
    /// Envelopes whose turn comes after `cancel` is signalled are skipped
    /// without being reported. Sends already issued are not rolled back when a
    /// later send fails.
    async fn publish(
        &self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<(), MessagingError>;

    /// Disconnect and release the native connection
    async fn close(&self) -> Result<(), MessagingError>;

    /// Get provider type
    fn provider_type(&self) -> ProviderType;
}

/// JSON convenience layer over any [`MessagePublisher`]
#[async_trait]
pub trait PublisherExt: MessagePublisher {
    /// Serialize each object to JSON and publish it as an envelope
    async fn publish_as_json<T>(
        &self,
        objects: &[T],
        cancel: &CancellationToken,
    ) -> Result<(), MessagingError>
    where
        T: Serialize + Sync,
    {
        let messages = objects
            .iter()
            .map(|object| Message::from_json(object))
            .collect::<Result<Vec<_>, _>>()?;

        self.publish(messages, cancel).await
    }
}

impl<P: MessagePublisher + ?Sized> PublisherExt for P {}

// ============================================================================
// Receiver Contract
// ============================================================================

/// Receives envelopes and acknowledges them.
///
/// Optional operations an adapter cannot perform fail with
/// [`MessagingError::NotSupported`], except `keep_alive` which is always
/// safe to call and silently does nothing when unsupported.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Connect, subscribe and deliver batches to `handler` until `cancel` fires.
    ///
    /// Handler failures cause the batch to be rejected and are not returned.
    /// Transport failures end the call with an error; reconnecting is the
    /// job of [`ReceiverExt::listen_with_retry`].
    async fn listen(
        &self,
        handler: MessageHandler,
        cancel: CancellationToken,
    ) -> Result<(), MessagingError>;

    /// Acknowledge successful processing. Envelopes without a pending
    /// acknowledgment are ignored, so confirming twice is harmless.
    async fn confirm(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<(), MessagingError>;

    /// Signal processing failure
    async fn reject(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<(), MessagingError>;

    /// Extend the processing lease of delivered envelopes
    async fn keep_alive(
        &self,
        _messages: &[Message],
        _time_to_live: Option<Duration>,
    ) -> Result<(), MessagingError> {
        Ok(())
    }

    /// Move envelopes to the dead-letter destination
    async fn dead_letter(
        &self,
        _messages: &[Message],
        _reason: &str,
        _error_description: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), MessagingError> {
        Err(MessagingError::not_supported(
            "dead_letter",
            self.provider_type(),
        ))
    }

    /// Count messages waiting for delivery
    async fn message_count(&self, _cancel: &CancellationToken) -> Result<u64, MessagingError> {
        Err(MessagingError::not_supported(
            "message_count",
            self.provider_type(),
        ))
    }

    /// Get provider type
    fn provider_type(&self) -> ProviderType;

    /// Get the optional operations this receiver performs
    fn capabilities(&self) -> Capabilities {
        self.provider_type().capabilities()
    }
}

/// Resilient listening helpers available on every [`MessageReceiver`]
#[async_trait]
pub trait ReceiverExt: MessageReceiver {
    /// Listen, reconnecting after transport failures until `cancel` fires
    async fn listen_with_retry(
        &self,
        handler: MessageHandler,
        policy: &RetryPolicy,
        cancel: CancellationToken,
    ) -> Result<(), MessagingError> {
        retry::listen_with_retry(self, handler, policy, cancel).await
    }

    /// Listen with retry, handing the handler JSON-deserialized messages.
    ///
    /// Acknowledgment stays with the caller; use [`crate::message::envelopes`]
    /// to confirm or reject the underlying envelopes.
    async fn listen_and_deserialize_json<T>(
        &self,
        handler: TypedHandler<T>,
        policy: &RetryPolicy,
        cancel: CancellationToken,
    ) -> Result<(), MessagingError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        retry::listen_with_retry(self, json_handler(handler), policy, cancel).await
    }
}

impl<R: MessageReceiver + ?Sized> ReceiverExt for R {}
