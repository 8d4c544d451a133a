//! Passive scalar monitor sampled over the staged window.
//!
//! Monitors ride along in the device list without any trigger role: they
//! start sampling a scalar signal when staged and stop when unstaged, so
//! the recorded window brackets the exposure exactly. Typical sources are
//! ring current, shutter state, and temperature readbacks.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::acquire::documents::now_ns;
use crate::device::{Device, DeviceFamily};
use crate::error::{AcquireError, AppResult};
use crate::signal::Signal;

/// One timestamped reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    /// Nanoseconds since Unix epoch
    pub time_ns: u64,
    pub value: f64,
}

#[derive(Debug, Default)]
struct MonitorState {
    staged: bool,
    stop_tx: Option<watch::Sender<bool>>,
}

/// Device that records a scalar signal while staged
#[derive(Debug, Clone)]
pub struct MonitorDevice {
    name: String,
    source: Signal<f64>,
    samples: Arc<Mutex<Vec<Sample>>>,
    state: Arc<RwLock<MonitorState>>,
}

impl MonitorDevice {
    pub fn new(name: impl Into<String>, source: Signal<f64>) -> Self {
        Self {
            name: name.into(),
            source,
            samples: Arc::new(Mutex::new(Vec::new())),
            state: Arc::new(RwLock::new(MonitorState::default())),
        }
    }

    /// Samples recorded during the most recent staged window
    pub fn samples(&self) -> Vec<Sample> {
        self.samples.lock().clone()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }
}

#[async_trait]
impl Device for MonitorDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> DeviceFamily {
        DeviceFamily::Monitor
    }

    async fn stage(&self) -> AppResult<()> {
        {
            let state = self.state.read();
            if state.staged {
                return Err(AcquireError::AlreadyStaged(self.name.clone()));
            }
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        {
            let mut samples = self.samples.lock();
            samples.clear();
            samples.push(Sample {
                time_ns: now_ns(),
                value: self.source.get(),
            });
        }

        let mut rx = self.source.subscribe();
        let samples = Arc::clone(&self.samples);
        let name = self.name.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let value = *rx.borrow_and_update();
                        samples.lock().push(Sample { time_ns: now_ns(), value });
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            debug!(device = %name, "monitor sampling stopped");
        });

        let mut state = self.state.write();
        state.stop_tx = Some(stop_tx);
        state.staged = true;
        info!(device = %self.name, source = self.source.name(), "monitor staged");
        Ok(())
    }

    async fn unstage(&self) -> AppResult<()> {
        let mut state = self.state.write();
        if let Some(stop_tx) = state.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        state.staged = false;
        info!(device = %self.name, samples = self.samples.lock().len(), "monitor unstaged");
        Ok(())
    }

    async fn is_staged(&self) -> AppResult<bool> {
        Ok(self.state.read().staged)
    }
}
