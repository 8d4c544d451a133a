//! Bounded retry policy for flaky external endpoints.
//!
//! Used anywhere the process talks to something that can be transiently
//! down: vendor detector sockets at connect time and the workflow
//! dispatcher. Retries are always bounded; nothing in the acquisition path
//! loops forever.

use std::time::Duration;

/// How many times to attempt an operation and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay between consecutive attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Single attempt, no waiting
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Whether `attempt` (1-based) leaves room for another try
    pub fn has_next(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
