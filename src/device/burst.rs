//! Burst-mode detector where the vendor box owns the exposure.
//!
//! In burst mode the vendor software decides the frame count and names the
//! output file itself; the host only starts the burst and watches a
//! detector-state enumeration flip busy and back to idle. Frame count and
//! file name arrive as readbacks after the burst completes, so the resource
//! allocated at stage time carries a provisional name that is rewritten on
//! completion.
//!
//! One burst is one logical point: a single datum is recorded per series
//! and the reported frame count becomes the resource's frames-per-point.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::acquire::documents::{AssetCache, ResourceDoc};
use crate::device::{AreaDetector, Device, DeviceFamily, StagingSetup, TriggerHandle};
use crate::error::{AcquireError, AppResult};
use crate::signal::Signal;

/// Detector-state enumeration published by the vendor box
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstState {
    Idle,
    Busy,
}

#[derive(Debug, Default)]
struct Inner {
    setup: Option<StagingSetup>,
    staged: bool,
    last_written: Option<String>,
}

/// Burst-mode hybrid detector
pub struct BurstDetector {
    name: String,
    start_cmd: Signal<bool>,
    det_state: Signal<BurstState>,
    reported_file: Signal<String>,
    reported_frames: Signal<u32>,
    poll_interval: Duration,
    state: Arc<RwLock<Inner>>,
    assets: AssetCache,
}

impl BurstDetector {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            start_cmd: Signal::new(format!("{name}.start"), false)
                .with_description("burst start command"),
            det_state: Signal::new(format!("{name}.state"), BurstState::Idle)
                .with_description("vendor detector state"),
            reported_file: Signal::new(format!("{name}.file"), String::new())
                .with_description("file name reported by the vendor box"),
            reported_frames: Signal::new(format!("{name}.frames"), 0u32)
                .with_description("frame count reported by the vendor box"),
            name,
            poll_interval: Duration::from_millis(100),
            state: Arc::new(RwLock::new(Inner::default())),
            assets: AssetCache::new(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Start command, observed by the vendor-side shim
    pub fn start_signal(&self) -> Signal<bool> {
        self.start_cmd.clone()
    }

    /// Detector-state readback
    pub fn state_signal(&self) -> Signal<BurstState> {
        self.det_state.clone()
    }

    /// Reported-file readback
    pub fn reported_file_signal(&self) -> Signal<String> {
        self.reported_file.clone()
    }

    /// Reported-frame-count readback
    pub fn reported_frames_signal(&self) -> Signal<u32> {
        self.reported_frames.clone()
    }
}

#[async_trait]
impl Device for BurstDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> DeviceFamily {
        DeviceFamily::Burst
    }

    async fn stage(&self) -> AppResult<()> {
        let setup = {
            let state = self.state.read();
            if state.staged {
                return Err(AcquireError::AlreadyStaged(self.name.clone()));
            }
            state.setup.clone().ok_or_else(|| {
                AcquireError::Device(format!("'{}' staged without a staging setup", self.name))
            })?
        };

        // Provisional name; the box reports the real one after the burst
        let provisional = format!("{}.imm", setup.file_name);
        self.assets
            .stage_resource(ResourceDoc::new(&self.name, &setup.file_path, &provisional));
        self.start_cmd.set_unchecked(false);

        let mut state = self.state.write();
        state.staged = true;
        info!(
            device = %self.name,
            family = self.family().label(),
            provisional = %provisional,
            "staged"
        );
        Ok(())
    }

    async fn unstage(&self) -> AppResult<()> {
        self.start_cmd.set_unchecked(false);
        self.state.write().staged = false;
        info!(device = %self.name, "unstaged");
        Ok(())
    }

    async fn is_staged(&self) -> AppResult<bool> {
        Ok(self.state.read().staged)
    }

    async fn trigger(&self) -> AppResult<Option<TriggerHandle>> {
        if !self.state.read().staged {
            return Err(AcquireError::Device(format!(
                "'{}' triggered while unstaged",
                self.name
            )));
        }

        self.start_cmd.set_unchecked(true);

        let (handle, tx) = TriggerHandle::channel(self.name.clone());
        let mut rx = self.det_state.subscribe();
        let poll = self.poll_interval;
        let state = Arc::clone(&self.state);
        let assets = self.assets.clone();
        let reported_file = self.reported_file.clone();
        let reported_frames = self.reported_frames.clone();
        let name = self.name.clone();
        tokio::spawn(async move {
            // Give the box one poll interval to leave idle
            tokio::time::sleep(poll).await;
            loop {
                if *rx.borrow_and_update() == BurstState::Idle {
                    break;
                }
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            let _ = tx.send(Err("detector state signal closed".to_string()));
                            return;
                        }
                    }
                    _ = tokio::time::sleep(poll) => {}
                }
            }

            let frames = reported_frames.get();
            let file = reported_file.get();
            if !file.is_empty() {
                assets.update_resource_file(&file);
            }
            assets.update_resource_frames(frames);
            assets.record_datums(1);
            state.write().last_written = if file.is_empty() { None } else { Some(file) };
            debug!(device = %name, frames, "burst complete");
            let _ = tx.send(Ok(()));
        });
        Ok(Some(handle))
    }
}

#[async_trait]
impl AreaDetector for BurstDetector {
    async fn staging_setup(&self, setup: &StagingSetup) -> AppResult<()> {
        setup.validate()?;
        self.state.write().setup = Some(setup.clone());
        Ok(())
    }

    async fn images_received(&self) -> AppResult<u32> {
        Ok(self.reported_frames.get())
    }

    fn frames_per_point(&self) -> u32 {
        self.reported_frames.get().max(1)
    }

    async fn written_file_name(&self) -> AppResult<String> {
        self.state.read().last_written.clone().ok_or_else(|| {
            AcquireError::Device(format!(
                "'{}' has not completed a burst to report",
                self.name
            ))
        })
    }

    fn assets(&self) -> &AssetCache {
        &self.assets
    }
}
