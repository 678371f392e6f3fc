//! # Retry Module
//!
//! Exponential backoff policy and the retry-wrapped listen loop.
//!
//! [`listen_with_retry`] keeps a receiver listening across transport
//! failures. Every reconnect is a fresh pass through the adapter's listen
//! state machine, so no subscription state is assumed to survive it.
//! Cancellation is the only way the loop ends without an error.

use crate::client::{MessageHandler, MessageReceiver};
use crate::error::MessagingError;
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Retry policy configuration for exponential backoff
///
/// # Examples
///
/// ```rust
/// use messaging_runtime::RetryPolicy;
/// use std::time::Duration;
///
/// // Default policy: unlimited attempts, 1s initial, 30s max, 2.0x multiplier
/// let policy = RetryPolicy::default();
/// assert!(policy.max_attempts.is_none());
///
/// // Bounded policy
/// let policy = RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(5), 1.5)
///     .with_max_attempts(3);
/// assert_eq!(policy.max_attempts, Some(3));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of reconnect attempts, `None` for unlimited
    pub max_attempts: Option<u32>,

    /// Initial delay before first retry
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Exponential backoff multiplier (typically 2.0)
    pub backoff_multiplier: f64,

    /// Whether to add jitter to delays
    pub use_jitter: bool,

    /// Jitter range as percentage (default 25% = ±25%)
    pub jitter_percent: f64,

    /// A listen pass that stayed up this long resets the attempt counter
    pub stable_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_jitter: true,
            jitter_percent: 0.25, // ±25%
            stable_after: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Create an unlimited retry policy with the given backoff curve
    pub fn new(initial_delay: Duration, max_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_multiplier,
            ..Self::default()
        }
    }

    /// Limit the number of reconnect attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Disable jitter (useful for deterministic tests)
    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Set custom jitter percentage (0.0 to 1.0)
    pub fn with_jitter_percent(mut self, percent: f64) -> Self {
        self.jitter_percent = percent.clamp(0.0, 1.0);
        self
    }

    /// Set how long a connection must survive before backoff starts over
    pub fn with_stable_after(mut self, stable_after: Duration) -> Self {
        self.stable_after = stable_after;
        self
    }

    /// Calculate delay for a specific retry attempt
    ///
    /// Uses exponential backoff formula: delay = initial * multiplier^attempt,
    /// capped at `max_delay`, then jittered if enabled.
    ///
    /// ```rust
    /// use messaging_runtime::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default().without_jitter();
    /// assert_eq!(policy.calculate_delay(0), Duration::from_secs(1));
    /// assert_eq!(policy.calculate_delay(3), Duration::from_secs(8));
    /// assert_eq!(policy.calculate_delay(10), Duration::from_secs(30));
    /// ```
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let capped_delay_secs = base_delay_secs.min(self.max_delay.as_secs_f64());

        let final_delay_secs = if self.use_jitter {
            Self::add_jitter(capped_delay_secs, self.jitter_percent)
        } else {
            capped_delay_secs
        };

        Duration::from_secs_f64(final_delay_secs)
    }

    /// Check if we should retry for this attempt number (0-based)
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max_attempts) => attempt < max_attempts,
            None => true,
        }
    }

    /// Applies random variation in range [delay * (1-jitter), delay * (1+jitter)]
    fn add_jitter(delay_secs: f64, jitter_percent: f64) -> f64 {
        let jitter_range = delay_secs * jitter_percent;
        if jitter_range <= 0.0 {
            return delay_secs;
        }

        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        (delay_secs + jitter).max(0.0)
    }
}

/// State tracker for retry operations
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Current retry attempt (0-based)
    pub attempt: u32,

    /// Total listen passes made so far (including the initial one)
    pub total_attempts: u32,
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryState {
    /// Create new retry state starting at attempt 0
    pub fn new() -> Self {
        Self {
            attempt: 0,
            total_attempts: 1,
        }
    }

    /// Increment to next retry attempt
    pub fn next_attempt(&mut self) {
        self.attempt += 1;
        self.total_attempts += 1;
    }

    /// Start the backoff curve over after a stable connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Get next delay from policy
    pub fn get_delay(&self, policy: &RetryPolicy) -> Duration {
        policy.calculate_delay(self.attempt)
    }

    /// Check if we can retry with this policy
    pub fn can_retry(&self, policy: &RetryPolicy) -> bool {
        policy.should_retry(self.attempt)
    }
}

// ============================================================================
// Retry-Wrapped Listen Loop
// ============================================================================

/// Keep `receiver` listening until `cancel` fires.
///
/// Transient failures (see [`MessagingError::is_transient`]) are followed by
/// a backoff delay and a fresh `listen` call. A `listen` that returns `Ok`
/// while the token is still live is treated as a dropped session and also
/// reconnects. Non-transient failures and an exhausted policy return the
/// error. Handler failures never reach this loop.
pub async fn listen_with_retry<R>(
    receiver: &R,
    handler: MessageHandler,
    policy: &RetryPolicy,
    cancel: CancellationToken,
) -> Result<(), MessagingError>
where
    R: MessageReceiver + ?Sized,
{
    let provider = receiver.provider_type();
    let mut state = RetryState::new();

    loop {
        if cancel.is_cancelled() {
            debug!(provider = %provider, "Listen loop cancelled");
            return Ok(());
        }

        let started = Instant::now();
        let outcome = receiver.listen(handler.clone(), cancel.clone()).await;

        if cancel.is_cancelled() {
            if let Err(e) = outcome {
                debug!(provider = %provider, error = %e, "Listener ended after cancellation");
            }
            return Ok(());
        }

        let failure = match outcome {
            Ok(()) => MessagingError::Transport {
                message: "listener stopped before cancellation".to_string(),
            },
            Err(e) if !e.should_retry() => {
                error!(provider = %provider, error = %e, "Listener failed with a permanent error");
                return Err(e);
            }
            Err(e) => e,
        };

        if started.elapsed() >= policy.stable_after {
            state.reset();
        }

        if !state.can_retry(policy) {
            error!(
                provider = %provider,
                error = %failure,
                total_attempts = state.total_attempts,
                "Listener retry attempts exhausted"
            );
            return Err(failure);
        }

        let delay = state.get_delay(policy);
        warn!(
            provider = %provider,
            error = %failure,
            attempt = state.attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Listener failed; reconnecting after backoff"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(provider = %provider, "Listen loop cancelled during backoff");
                return Ok(());
            }
            _ = tokio::time::sleep(delay) => {}
        }

        state.next_attempt();
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
