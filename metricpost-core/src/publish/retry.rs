//! Retry and backoff policy for asynchronous delivery
//!
//! Each batch moves through:
//!
//! ```text
//! Pending -> Attempting -> Succeeded
//!                       -> RetryScheduled -> Attempting ...
//!                       -> Exhausted
//! ```
//!
//! Attempt `n` (0-based) that fails is retried after `2^n * 1000 ms` while
//! `n < max_retries`; the failure of attempt `max_retries` exhausts the batch.

use std::time::Duration;

/// Base unit of the exponential backoff
const BASE_DELAY: Duration = Duration::from_millis(1000);

/// Largest exponent applied, keeping the delay representable
const MAX_EXPONENT: u32 = 20;

/// Delivery state of one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Extracted from the queue, not yet sent
    Pending,
    /// A request for attempt `attempt` is in flight
    Attempting { attempt: u32 },
    /// Delivered
    Succeeded,
    /// Attempt `attempt` failed; the next one starts after `delay`
    RetryScheduled { attempt: u32, delay: Duration },
    /// Every attempt failed; the batch belongs to the archive
    Exhausted { attempts: u32 },
}

impl DeliveryState {
    /// Transition after the outcome of the current attempt
    pub fn next(self, policy: &RetryPolicy, succeeded: bool) -> DeliveryState {
        match self {
            DeliveryState::Pending => DeliveryState::Attempting { attempt: 0 },
            DeliveryState::Attempting { .. } if succeeded => DeliveryState::Succeeded,
            DeliveryState::Attempting { attempt } => match policy.on_failure(attempt) {
                RetryDecision::Retry { delay } => DeliveryState::RetryScheduled { attempt, delay },
                RetryDecision::Exhausted => DeliveryState::Exhausted {
                    attempts: attempt + 1,
                },
            },
            DeliveryState::RetryScheduled { attempt, .. } => DeliveryState::Attempting {
                attempt: attempt + 1,
            },
            terminal => terminal,
        }
    }

    /// True for `Succeeded` and `Exhausted`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Succeeded | DeliveryState::Exhausted { .. }
        )
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`
    Retry { delay: Duration },
    /// Give up and archive the batch
    Exhausted,
}

/// Exponential backoff bounded by a retry count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl RetryPolicy {
    /// Allow `max_retries` retries after the first attempt
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Configured retry count
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retrying after attempt `attempt` failed: `2^attempt` seconds
    pub fn backoff(&self, attempt: u32) -> Duration {
        BASE_DELAY * 2u32.pow(attempt.min(MAX_EXPONENT))
    }

    /// Decide the follow-up to a failed attempt `attempt` (0-based)
    pub fn on_failure(&self, attempt: u32) -> RetryDecision {
        if attempt < self.max_retries {
            RetryDecision::Retry {
                delay: self.backoff(attempt),
            }
        } else {
            RetryDecision::Exhausted
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}
