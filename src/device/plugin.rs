//! Plugin-style area detector with an IOC-side file writer.
//!
//! Models the common EPICS areaDetector arrangement: the camera driver
//! exposes timing and frame-count settings, a file-writer plugin owns the
//! output path and a captured-frame counter, and the host process never
//! touches pixel data. The hardware side is represented by [`Signal`]s; a
//! driver shim (or a test fixture) publishes the captured count as frames
//! land on disk.
//!
//! Completion is counter-driven: `trigger()` resolves its handle once the
//! captured count reaches the staged frame count.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::acquire::documents::{AssetCache, ResourceDoc};
use crate::acquire::staging::{Directive, DirectiveSink, StagingPlan};
use crate::device::{
    series_file_name, AreaDetector, Device, DeviceFamily, StagingSetup, TriggerHandle,
};
use crate::error::{AcquireError, AppResult};
use crate::signal::Signal;

#[derive(Debug)]
struct PluginState {
    setup: Option<StagingSetup>,
    staged: bool,
    // First frame number of the next series, 1-based, monotonic across runs
    next_frame: u32,
    pending_file: Option<String>,
    last_written: Option<String>,
    staging_trace: Vec<&'static str>,
    writer_path: Option<PathBuf>,
    writer_name: Option<String>,
    frame_count: u32,
    acquire_time: f64,
    acquire_period: f64,
}

impl Default for PluginState {
    fn default() -> Self {
        Self {
            setup: None,
            staged: false,
            next_frame: 1,
            pending_file: None,
            last_written: None,
            staging_trace: Vec::new(),
            writer_path: None,
            writer_name: None,
            frame_count: 0,
            acquire_time: 0.0,
            acquire_period: 0.0,
        }
    }
}

/// Area detector whose frames are written by a file plugin on the IOC side
#[derive(Debug, Clone)]
pub struct FilePluginDetector {
    name: String,
    frames_per_point: u32,
    needs_pulses: bool,
    captured: Signal<u32>,
    capture_enabled: Signal<bool>,
    state: Arc<RwLock<PluginState>>,
    assets: AssetCache,
}

impl FilePluginDetector {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            captured: Signal::new(format!("{name}.captured"), 0u32)
                .with_description("frames confirmed written by the file plugin"),
            capture_enabled: Signal::new(format!("{name}.capture"), false)
                .with_description("file plugin capture enable"),
            name,
            frames_per_point: 1,
            needs_pulses: false,
            state: Arc::new(RwLock::new(PluginState::default())),
            assets: AssetCache::new(),
        }
    }

    pub fn with_frames_per_point(mut self, frames_per_point: u32) -> Self {
        self.frames_per_point = frames_per_point.max(1);
        self
    }

    /// Mark this detector as depending on an external pulse generator
    pub fn with_external_pulses(mut self) -> Self {
        self.needs_pulses = true;
        self
    }

    /// Captured-frame counter, shared with the driver shim and monitors
    pub fn captured_signal(&self) -> Signal<u32> {
        self.captured.clone()
    }

    /// Capture-enable readback
    pub fn capture_enable_signal(&self) -> Signal<bool> {
        self.capture_enabled.clone()
    }

    /// Directive labels applied during the most recent `stage()`
    pub fn staging_trace(&self) -> Vec<&'static str> {
        self.state.read().staging_trace.clone()
    }

    fn logical_points(&self, frames: u32) -> u32 {
        frames.div_ceil(self.frames_per_point)
    }
}

#[async_trait]
impl DirectiveSink for FilePluginDetector {
    async fn apply_directive(&self, directive: &Directive) -> AppResult<()> {
        let mut state = self.state.write();
        state.staging_trace.push(directive.label());
        match directive {
            Directive::OutputPath(path) => state.writer_path = Some(path.clone()),
            Directive::OutputName(name) => state.writer_name = Some(name.clone()),
            Directive::FrameCount(count) => state.frame_count = *count,
            Directive::AcquireTime(time) => state.acquire_time = *time,
            Directive::AcquirePeriod(period) => state.acquire_period = *period,
            Directive::CaptureEnable => {
                // Capture enable resets the plugin's frame counter
                self.captured.set_unchecked(0);
                self.capture_enabled.set_unchecked(true);
            }
        }
        debug!(device = %self.name, directive = directive.label(), "applied staging directive");
        Ok(())
    }
}

#[async_trait]
impl Device for FilePluginDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> DeviceFamily {
        DeviceFamily::Plugin
    }

    async fn stage(&self) -> AppResult<()> {
        let (setup, begin) = {
            let state = self.state.read();
            if state.staged {
                return Err(AcquireError::AlreadyStaged(self.name.clone()));
            }
            let setup = state.setup.clone().ok_or_else(|| {
                AcquireError::Device(format!("'{}' staged without a staging setup", self.name))
            })?;
            (setup, state.next_frame)
        };

        let end = begin + setup.num_images - 1;
        let file = series_file_name(&setup.file_name, begin, end);
        self.assets.stage_resource(
            ResourceDoc::new(&self.name, &setup.file_path, &file)
                .with_frames_per_point(self.frames_per_point),
        );

        {
            let mut state = self.state.write();
            state.staging_trace.clear();
            state.pending_file = Some(file.clone());
        }
        StagingPlan::for_setup(&setup).apply(self).await?;

        let mut state = self.state.write();
        state.next_frame = end + 1;
        state.staged = true;
        info!(
            device = %self.name,
            family = self.family().label(),
            file = %file,
            frames = setup.num_images,
            "staged"
        );
        Ok(())
    }

    async fn unstage(&self) -> AppResult<()> {
        self.capture_enabled.set_unchecked(false);
        let mut state = self.state.write();
        state.staged = false;
        state.pending_file = None;
        info!(device = %self.name, "unstaged");
        Ok(())
    }

    async fn is_staged(&self) -> AppResult<bool> {
        Ok(self.state.read().staged)
    }

    async fn trigger(&self) -> AppResult<Option<TriggerHandle>> {
        let target = {
            let state = self.state.read();
            if !state.staged {
                return Err(AcquireError::Device(format!(
                    "'{}' triggered while unstaged",
                    self.name
                )));
            }
            state.frame_count
        };
        if !self.capture_enabled.get() {
            return Err(AcquireError::Device(format!(
                "'{}' triggered with capture disabled",
                self.name
            )));
        }

        let (handle, tx) = TriggerHandle::channel(self.name.clone());
        let mut rx = self.captured.subscribe();
        let state = Arc::clone(&self.state);
        let assets = self.assets.clone();
        let points = self.logical_points(target);
        let name = self.name.clone();
        tokio::spawn(async move {
            loop {
                if *rx.borrow_and_update() >= target {
                    break;
                }
                if rx.changed().await.is_err() {
                    let _ = tx.send(Err("captured-count signal closed".to_string()));
                    return;
                }
            }
            {
                let mut state = state.write();
                state.last_written = state.pending_file.take();
            }
            assets.record_datums(points);
            debug!(device = %name, frames = target, "exposure series complete");
            let _ = tx.send(Ok(()));
        });
        Ok(Some(handle))
    }
}

#[async_trait]
impl AreaDetector for FilePluginDetector {
    async fn staging_setup(&self, setup: &StagingSetup) -> AppResult<()> {
        setup.validate()?;
        self.state.write().setup = Some(setup.clone());
        Ok(())
    }

    async fn images_received(&self) -> AppResult<u32> {
        Ok(self.captured.get())
    }

    fn frames_per_point(&self) -> u32 {
        self.frames_per_point
    }

    fn needs_external_pulses(&self) -> bool {
        self.needs_pulses
    }

    async fn written_file_name(&self) -> AppResult<String> {
        self.state.read().last_written.clone().ok_or_else(|| {
            AcquireError::Device(format!(
                "'{}' has no completed exposure series to report",
                self.name
            ))
        })
    }

    fn assets(&self) -> &AssetCache {
        &self.assets
    }
}
