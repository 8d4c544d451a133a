//! External trigger-pulse generator.
//!
//! Detectors that cannot self-pace their exposures take frame pulses from a
//! hardware generator. The generator is armed separately from the device
//! list: the orchestrator starts it while detector triggers are already in
//! flight, because a pulse train that begins before the detectors are
//! armed drops the first frames.
//!
//! After enabling output the hardware needs a short settling delay before
//! the first pulse is honored; `start()` does not return until that delay
//! has elapsed.

use std::time::Duration;

use tracing::info;

use crate::error::AppResult;
use crate::signal::Signal;

/// Pulse generator with an enable line and a fixed arm delay
#[derive(Debug, Clone)]
pub struct PulseGenerator {
    name: String,
    enabled: Signal<bool>,
    arm_delay: Duration,
}

impl PulseGenerator {
    pub fn new(name: impl Into<String>, arm_delay: Duration) -> Self {
        let name = name.into();
        Self {
            enabled: Signal::new(format!("{name}.enabled"), false)
                .with_description("pulse output enable"),
            name,
            arm_delay,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enable line readback, shared with hardware shims
    pub fn enabled_signal(&self) -> Signal<bool> {
        self.enabled.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    /// Enable pulse output and wait out the arm delay.
    ///
    /// The generator is not guaranteed to be producing pulses until this
    /// returns.
    pub async fn start(&self) -> AppResult<()> {
        self.enabled.set_unchecked(true);
        tokio::time::sleep(self.arm_delay).await;
        info!(generator = %self.name, arm_delay = ?self.arm_delay, "pulse output enabled");
        Ok(())
    }

    /// Disable pulse output
    pub async fn stop(&self) -> AppResult<()> {
        self.enabled.set_unchecked(false);
        info!(generator = %self.name, "pulse output disabled");
        Ok(())
    }
}
