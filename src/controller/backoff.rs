//! # Backoff
//!
//! Delay calculations for broker operation polling, retries of failed broker
//! calls, and internal reconcile errors.
//!
//! Operation scheduling is a pure function of the persisted operation start
//! time and attempt counter, so a restarted controller resumes with the same
//! delays and the same retry budget.
//!
//! ## Usage
//!
//! ```rust
//! use service_catalog_controller::controller::backoff::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::default();
//! assert_eq!(policy.poll_delay(0), Duration::from_secs(1));
//! assert_eq!(policy.poll_delay(3), Duration::from_secs(8));
//! ```

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Retry budget and exponential delay curve for broker operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long an operation may keep retrying, measured from its start
    pub retry_duration: Duration,
    /// First delay between last-operation polls
    pub poll_initial: Duration,
    /// First delay before re-issuing a failed synchronous call
    pub retry_initial: Duration,
    /// Cap applied to every computed delay
    pub max_delay: Duration,
    /// Growth factor between consecutive attempts; `1` keeps the delay flat
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            retry_duration: Duration::from_secs(DEFAULT_RECONCILIATION_RETRY_DURATION_SECS),
            poll_initial: Duration::from_secs(DEFAULT_OPERATION_POLLING_INITIAL_BACKOFF_SECS),
            retry_initial: Duration::from_secs(DEFAULT_RETRY_INITIAL_BACKOFF_SECS),
            max_delay: Duration::from_secs(DEFAULT_OPERATION_POLLING_MAXIMUM_BACKOFF_SECS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

/// Outcome of evaluating the retry state of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Time spent since the operation started
    pub elapsed: Duration,
    /// The operation ran out of budget and must be finished terminally
    pub retry_expired: bool,
    /// Delay to wait before the next attempt
    pub next_delay: Duration,
}

impl RetryPolicy {
    /// `min(initial * multiplier^attempt, max)`
    fn curve(&self, initial: Duration, attempt: u32) -> Duration {
        let factor = u64::from(self.multiplier).checked_pow(attempt);
        let raw = factor
            .and_then(|f| initial.as_millis().checked_mul(u128::from(f)))
            .unwrap_or(u128::MAX);
        let capped = raw.min(self.max_delay.as_millis());
        Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX))
    }

    /// Delay before the next last-operation poll
    #[must_use]
    pub fn poll_delay(&self, attempt: u32) -> Duration {
        self.curve(self.poll_initial, attempt)
    }

    /// Delay before re-issuing a failed synchronous broker call
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.curve(self.retry_initial, attempt)
    }

    /// True once `now - start >= retry_duration`
    #[must_use]
    pub fn is_expired(&self, start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        elapsed_since(start, now) >= self.retry_duration
    }

    /// Evaluate the retry state of an operation for a failed call
    #[must_use]
    pub fn evaluate(&self, start: DateTime<Utc>, now: DateTime<Utc>, attempt: u32) -> RetryDecision {
        let elapsed = elapsed_since(start, now);
        RetryDecision {
            elapsed,
            retry_expired: elapsed >= self.retry_duration,
            next_delay: self.retry_delay(attempt),
        }
    }

    /// Evaluate the retry state of an operation for an outstanding poll
    #[must_use]
    pub fn evaluate_poll(
        &self,
        start: DateTime<Utc>,
        now: DateTime<Utc>,
        attempt: u32,
    ) -> RetryDecision {
        RetryDecision {
            next_delay: self.poll_delay(attempt),
            ..self.evaluate(start, now, attempt)
        }
    }
}

/// Clock skew that puts `start` in the future counts as zero elapsed time
fn elapsed_since(start: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - start).to_std().unwrap_or(Duration::ZERO)
}

/// Fibonacci backoff calculator
///
/// Used by the controller error policy for unexpected reconcile errors (store
/// failures, serialization), independent of the broker operation budget.
///
/// # Example
///
/// ```
/// use service_catalog_controller::controller::backoff::FibonacciBackoff;
/// use std::time::Duration;
///
/// let mut backoff = FibonacciBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
/// assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
/// assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
/// assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_secs: u64,
    prev_secs: u64,
    current_secs: u64,
    max_secs: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with specified minimum and maximum values
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        let min_secs = min.as_secs().max(1);
        Self {
            min_secs,
            prev_secs: 0,
            current_secs: min_secs,
            max_secs: max.as_secs().max(min_secs),
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current_secs;
        let next = self.prev_secs.saturating_add(self.current_secs);
        self.prev_secs = self.current_secs;
        self.current_secs = next.min(self.max_secs);
        Duration::from_secs(result)
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_secs = 0;
        self.current_secs = self.min_secs;
    }
}
