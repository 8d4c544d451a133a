//! Pure-software detector that writes real sparse containers.
//!
//! Behaves like a plugin-style detector from the orchestrator's point of
//! view, but there is no hardware behind it: a spawned exposure task
//! synthesizes sparse photon frames with `rand` and writes them through
//! [`ImmWriter`](crate::imm::ImmWriter) at the configured period. The files
//! it produces read back through [`ImmReader`](crate::imm::ImmReader) like
//! any detector output, which makes it the workhorse for exercising the
//! full acquisition path without a beamline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info};

use crate::acquire::documents::{AssetCache, ResourceDoc};
use crate::device::{
    series_file_name, AreaDetector, Device, DeviceFamily, StagingSetup, TriggerHandle,
};
use crate::error::{AcquireError, AppResult};
use crate::imm::ImmWriter;
use crate::signal::Signal;

#[derive(Debug)]
struct SimState {
    setup: Option<StagingSetup>,
    staged: bool,
    next_frame: u32,
    pending_file: Option<String>,
    last_written: Option<String>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            setup: None,
            staged: false,
            next_frame: 1,
            pending_file: None,
            last_written: None,
        }
    }
}

/// Simulated sparse detector
#[derive(Debug, Clone)]
pub struct SimDetector {
    name: String,
    rows: u32,
    cols: u32,
    mean_photons: u32,
    frame_interval: Option<Duration>,
    frames_per_point: u32,
    needs_pulses: bool,
    captured: Signal<u32>,
    state: Arc<RwLock<SimState>>,
    assets: AssetCache,
}

impl SimDetector {
    pub fn new(name: impl Into<String>, rows: u32, cols: u32) -> Self {
        let name = name.into();
        Self {
            captured: Signal::new(format!("{name}.captured"), 0u32)
                .with_description("frames written by the simulated exposure task"),
            name,
            rows,
            cols,
            mean_photons: 64,
            frame_interval: None,
            frames_per_point: 1,
            needs_pulses: false,
            state: Arc::new(RwLock::new(SimState::default())),
            assets: AssetCache::new(),
        }
    }

    /// Average sparse photon count per frame
    pub fn with_mean_photons(mut self, mean_photons: u32) -> Self {
        self.mean_photons = mean_photons.max(1);
        self
    }

    /// Override the per-frame pacing instead of honoring the staged
    /// acquire period. Tests use `Duration::ZERO` to run flat out.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = Some(interval);
        self
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

    /// Captured-frame counter, shared with monitors
    pub fn captured_signal(&self) -> Signal<u32> {
        self.captured.clone()
    }

    fn synthesize_frame(rows: u32, cols: u32, mean_photons: u32) -> (Vec<u32>, Vec<u16>) {
        let pixels = rows * cols;
        let mut rng = rand::thread_rng();
        let low = (mean_photons / 2).max(1);
        let high = (mean_photons * 3 / 2).max(low + 1);
        let count = rng.gen_range(low..=high).min(pixels);

        let mut indices: Vec<u32> = (0..count).map(|_| rng.gen_range(0..pixels)).collect();
        indices.sort_unstable();
        indices.dedup();
        let values: Vec<u16> = indices.iter().map(|_| rng.gen_range(1..=12u16)).collect();
        (indices, values)
    }
}

#[async_trait]
impl Device for SimDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> DeviceFamily {
        DeviceFamily::Simulated
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

        std::fs::create_dir_all(&setup.file_path)?;
        let end = begin + setup.num_images - 1;
        let file = series_file_name(&setup.file_name, begin, end);
        self.assets.stage_resource(
            ResourceDoc::new(&self.name, &setup.file_path, &file)
                .with_frames_per_point(self.frames_per_point),
        );
        self.captured.set_unchecked(0);

        let mut state = self.state.write();
        state.pending_file = Some(file.clone());
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
        let (setup, file) = {
            let state = self.state.read();
            if !state.staged {
                return Err(AcquireError::Device(format!(
                    "'{}' triggered while unstaged",
                    self.name
                )));
            }
            let setup = state.setup.clone().ok_or_else(|| {
                AcquireError::Device(format!("'{}' has no staging setup", self.name))
            })?;
            let file = state.pending_file.clone().ok_or_else(|| {
                AcquireError::Device(format!("'{}' has no pending output file", self.name))
            })?;
            (setup, file)
        };

        let path = setup.file_path.join(&file);
        let mut writer = ImmWriter::create(&path, self.rows, self.cols, setup.acquire_time)?;
        let interval = self
            .frame_interval
            .unwrap_or_else(|| Duration::from_secs_f64(setup.acquire_period));

        let (handle, tx) = TriggerHandle::channel(self.name.clone());
        let captured = self.captured.clone();
        let state = Arc::clone(&self.state);
        let assets = self.assets.clone();
        let points = setup.num_images.div_ceil(self.frames_per_point);
        let (rows, cols, mean) = (self.rows, self.cols, self.mean_photons);
        let name = self.name.clone();
        tokio::spawn(async move {
            for n in 1..=setup.num_images {
                if !interval.is_zero() {
                    tokio::time::sleep(interval).await;
                }
                let (indices, values) = Self::synthesize_frame(rows, cols, mean);
                if let Err(e) = writer.write_sparse_frame(&indices, &values) {
                    let _ = tx.send(Err(format!("frame {n} write failed: {e}")));
                    return;
                }
                captured.set_unchecked(n);
            }
            if let Err(e) = writer.finish() {
                let _ = tx.send(Err(format!("container flush failed: {e}")));
                return;
            }
            {
                let mut state = state.write();
                state.last_written = state.pending_file.take();
            }
            assets.record_datums(points);
            debug!(device = %name, frames = setup.num_images, path = %path.display(), "series written");
            let _ = tx.send(Ok(()));
        });
        Ok(Some(handle))
    }
}

#[async_trait]
impl AreaDetector for SimDetector {
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
