//! Settling waits for closed-loop process variables.
//!
//! Temperature controllers and similar slow loops are commanded to a
//! setpoint and then watched until the readback sits within tolerance of
//! the target. The wait is event-driven: a subscription to the readback
//! signal is the primary wakeup, with a poll tick as fallback so a wait
//! can still conclude if the subscription goes quiet, and a separate
//! report tick that logs progress on long waits.
//!
//! Timeouts are policy, not always failures: `timeout_fail` selects
//! between raising [`AcquireError::SettleTimeout`] and returning a
//! non-settled [`SettleOutcome`] for the caller to act on.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{AcquireError, AppResult};
use crate::signal::Signal;

/// Result of a settle wait that was allowed to time out
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettleOutcome {
    /// Whether the readback reached tolerance before the deadline
    pub settled: bool,
    /// Last readback value observed
    pub readback: f64,
    /// Time spent waiting
    pub elapsed: Duration,
}

/// Wait for a readback signal to settle within tolerance of a target
#[derive(Debug, Clone)]
pub struct SettleWait {
    name: String,
    readback: Signal<f64>,
    target: f64,
    tolerance: f64,
    poll_interval: Duration,
    report_interval: Duration,
}

impl SettleWait {
    /// # Errors
    /// Returns `Configuration` if the tolerance is negative or not finite,
    /// or the target is not finite.
    pub fn new(
        name: impl Into<String>,
        readback: Signal<f64>,
        target: f64,
        tolerance: f64,
    ) -> AppResult<Self> {
        if !target.is_finite() {
            return Err(AcquireError::Configuration(format!(
                "settle target must be finite, got {target}"
            )));
        }
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(AcquireError::Configuration(format!(
                "settle tolerance must be non-negative, got {tolerance}"
            )));
        }
        Ok(Self {
            name: name.into(),
            readback,
            target,
            tolerance,
            poll_interval: Duration::from_millis(100),
            report_interval: Duration::from_secs(10),
        })
    }

    /// Override the poll and progress-report cadence
    pub fn with_intervals(mut self, poll_interval: Duration, report_interval: Duration) -> Self {
        if !poll_interval.is_zero() {
            self.poll_interval = poll_interval;
        }
        if !report_interval.is_zero() {
            self.report_interval = report_interval;
        }
        self
    }

    /// Setpoint the readback is expected to reach
    pub fn target(&self) -> f64 {
        self.target
    }

    /// Acceptance band around the target
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Whether the readback is currently within tolerance
    pub fn is_settled(&self) -> bool {
        (self.readback.get() - self.target).abs() <= self.tolerance
    }

    /// Wait until the readback settles or `timeout` elapses.
    ///
    /// With `timeout_fail` set, a timeout raises `SettleTimeout`; otherwise
    /// the non-settled outcome is returned as a normal value.
    pub async fn wait_until_settled(
        &self,
        timeout: Duration,
        timeout_fail: bool,
    ) -> AppResult<SettleOutcome> {
        let begin = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.readback.subscribe();
        let mut events_alive = true;
        let mut poll = tokio::time::interval(self.poll_interval);
        let mut report = tokio::time::interval_at(
            tokio::time::Instant::now() + self.report_interval,
            self.report_interval,
        );

        loop {
            let readback = self.readback.get();
            if (readback - self.target).abs() <= self.tolerance {
                let elapsed = begin.elapsed();
                info!(
                    name = %self.name,
                    readback,
                    target = self.target,
                    elapsed = ?elapsed,
                    "settled"
                );
                return Ok(SettleOutcome {
                    settled: true,
                    readback,
                    elapsed,
                });
            }

            tokio::select! {
                changed = rx.changed(), if events_alive => {
                    if changed.is_err() {
                        // Readback source dropped; keep going on poll ticks
                        events_alive = false;
                    }
                }
                _ = poll.tick() => {}
                _ = report.tick() => {
                    info!(
                        name = %self.name,
                        readback,
                        target = self.target,
                        tolerance = self.tolerance,
                        elapsed = ?begin.elapsed(),
                        "waiting for settle"
                    );
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let elapsed = begin.elapsed();
                    if timeout_fail {
                        return Err(AcquireError::SettleTimeout {
                            name: self.name.clone(),
                            readback,
                            target: self.target,
                            tolerance: self.tolerance,
                            elapsed,
                        });
                    }
                    warn!(
                        name = %self.name,
                        readback,
                        target = self.target,
                        elapsed = ?elapsed,
                        "settle timed out, continuing"
                    );
                    return Ok(SettleOutcome {
                        settled: false,
                        readback,
                        elapsed,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_for(signal: &Signal<f64>, target: f64, tolerance: f64) -> SettleWait {
        SettleWait::new("loop", signal.clone(), target, tolerance)
            .unwrap()
            .with_intervals(Duration::from_millis(10), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn already_settled_returns_immediately() {
        let readback = Signal::new("temp", 25.01f64);
        let wait = wait_for(&readback, 25.0, 0.05);
        let outcome = wait
            .wait_until_settled(Duration::from_secs(1), true)
            .await
            .unwrap();
        assert!(outcome.settled);
        assert!(outcome.elapsed < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn readback_change_wakes_the_wait_before_any_poll() {
        let readback = Signal::new("temp", 20.0f64);
        // Poll cadence far slower than the event should arrive
        let wait = SettleWait::new("loop", readback.clone(), 25.0, 0.1)
            .unwrap()
            .with_intervals(Duration::from_secs(2), Duration::from_secs(10));

        let source = readback.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            source.set_unchecked(24.95);
        });

        let begin = Instant::now();
        let outcome = wait
            .wait_until_settled(Duration::from_secs(5), true)
            .await
            .unwrap();
        assert!(outcome.settled);
        assert!(begin.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn timeout_fail_raises_with_context() {
        let readback = Signal::new("temp", 20.0f64);
        let wait = wait_for(&readback, 25.0, 0.01);

        let begin = Instant::now();
        let err = wait
            .wait_until_settled(Duration::from_millis(50), true)
            .await
            .unwrap_err();
        assert!(begin.elapsed() >= Duration::from_millis(50));

        match err {
            AcquireError::SettleTimeout {
                readback, target, ..
            } => {
                assert_eq!(readback, 20.0);
                assert_eq!(target, 25.0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn tolerated_timeout_returns_non_settled_outcome() {
        let readback = Signal::new("temp", 20.0f64);
        let wait = wait_for(&readback, 25.0, 0.01);
        let outcome = wait
            .wait_until_settled(Duration::from_millis(50), false)
            .await
            .unwrap();
        assert!(!outcome.settled);
        assert_eq!(outcome.readback, 20.0);
        assert!(outcome.elapsed >= Duration::from_millis(50));
    }

    #[test]
    fn invalid_tolerance_is_rejected_up_front() {
        let readback = Signal::new("temp", 0.0f64);
        assert!(SettleWait::new("loop", readback.clone(), 25.0, -0.1).is_err());
        assert!(SettleWait::new("loop", readback.clone(), f64::NAN, 0.1).is_err());
        assert!(SettleWait::new("loop", readback, 25.0, f64::INFINITY).is_err());
    }
}
