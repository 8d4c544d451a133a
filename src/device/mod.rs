//! Device capability abstraction for acquisition hardware.
//!
//! Every piece of hardware that participates in an acquisition implements
//! [`Device`]; detectors additionally implement [`AreaDetector`]. The
//! orchestrator only ever sees trait objects, so one acquisition loop drives
//! plugin-based cameras, vendor-controlled boxes, burst-mode hybrids, and
//! passive monitors without knowing which is which.
//!
//! # Design Principles
//!
//! 1. **Trait objects at the seam**: the orchestrator holds
//!    `Arc<dyn AreaDetector>` / `Arc<dyn Device>` and nothing more specific.
//! 2. **Async by default**: every hardware interaction is `async` via
//!    `async_trait`; implementations talk to sockets, signals, or the
//!    filesystem without blocking the runtime.
//! 3. **Optional capabilities fail loudly**: methods a device cannot honor
//!    return an error naming the device rather than pretending to succeed.
//! 4. **Completion is a value**: `trigger()` hands back a [`TriggerHandle`]
//!    the caller awaits, so slow hardware never holds a lock while exposing.
//!
//! # Contract
//!
//! - `stage()` commits the previously applied setup to hardware and
//!   allocates the output container; staging twice without an intervening
//!   `unstage()` is an error.
//! - `unstage()` releases acquisition state and must succeed even after a
//!   failed or interrupted run.
//! - `trigger()` starts an exposure series and returns `Ok(None)` when the
//!   device has nothing to wait for (monitors, shutters).

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::acquire::documents::AssetCache;
use crate::error::{AcquireError, AppResult};

pub mod burst;
pub mod monitor;
pub mod plugin;
pub mod pulse;
pub mod sim;
pub mod vendor;

pub use burst::BurstDetector;
pub use monitor::MonitorDevice;
pub use plugin::FilePluginDetector;
pub use pulse::PulseGenerator;
pub use sim::SimDetector;
pub use vendor::VendorSocketDetector;

/// Broad classification of a device, used for log context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    /// Camera with an IOC-side file-writer plugin
    Plugin,
    /// Detector driven over a raw vendor TCP socket
    VendorSocket,
    /// Burst-mode hybrid where the vendor box names its own files
    Burst,
    /// Pure-software detector that writes real containers
    Simulated,
    /// Passive scalar sampler with no trigger role
    Monitor,
}

impl DeviceFamily {
    /// Short lowercase label for log fields
    pub fn label(&self) -> &'static str {
        match self {
            DeviceFamily::Plugin => "plugin",
            DeviceFamily::VendorSocket => "vendor",
            DeviceFamily::Burst => "burst",
            DeviceFamily::Simulated => "sim",
            DeviceFamily::Monitor => "monitor",
        }
    }
}

/// Acquisition parameters applied to a detector before staging.
///
/// Carries exactly the values a detector needs to configure one exposure
/// series. Applying a setup must not start anything; hardware side effects
/// belong to `stage()`.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingSetup {
    /// Directory the detector (or its plugin) writes into
    pub file_path: std::path::PathBuf,
    /// Base file name, without directory components or extension
    pub file_name: String,
    /// Number of exposures in the series
    pub num_images: u32,
    /// Exposure time per frame, seconds
    pub acquire_time: f64,
    /// Frame-to-frame period, seconds
    pub acquire_period: f64,
}

impl StagingSetup {
    /// Check field contents, returning `InvalidArgument` on the first
    /// violation.
    pub fn validate(&self) -> AppResult<()> {
        if self.file_path.as_os_str().is_empty() {
            return Err(AcquireError::InvalidArgument(
                "staging setup requires a non-empty file path".to_string(),
            ));
        }
        if self.file_name.is_empty() {
            return Err(AcquireError::InvalidArgument(
                "staging setup requires a non-empty file name".to_string(),
            ));
        }
        if self.file_name.contains(std::path::MAIN_SEPARATOR) {
            return Err(AcquireError::InvalidArgument(format!(
                "file name '{}' must not contain directory separators",
                self.file_name
            )));
        }
        if self.num_images == 0 {
            return Err(AcquireError::InvalidArgument(
                "staging setup requires at least one image".to_string(),
            ));
        }
        if !self.acquire_time.is_finite() || self.acquire_time <= 0.0 {
            return Err(AcquireError::InvalidArgument(format!(
                "acquire time must be positive, got {}",
                self.acquire_time
            )));
        }
        if !self.acquire_period.is_finite() || self.acquire_period <= 0.0 {
            return Err(AcquireError::InvalidArgument(format!(
                "acquire period must be positive, got {}",
                self.acquire_period
            )));
        }
        Ok(())
    }
}

/// Awaitable completion of one triggered exposure series.
///
/// A device's `trigger()` returns immediately; the exposure runs in a
/// spawned task that resolves the handle when the hardware reports done.
/// Dropping the sender without resolving surfaces as a device error, so a
/// crashed completion task cannot hang the acquisition silently (the
/// orchestrator still wraps the wait in its own timeout).
#[derive(Debug)]
pub struct TriggerHandle {
    device: String,
    rx: oneshot::Receiver<Result<(), String>>,
}

impl TriggerHandle {
    /// Create a handle and the sender its completion task resolves
    pub fn channel(device: impl Into<String>) -> (Self, oneshot::Sender<Result<(), String>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                device: device.into(),
                rx,
            },
            tx,
        )
    }

    /// Name of the device this handle belongs to
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Wait for the exposure series to complete
    pub async fn wait(self) -> AppResult<()> {
        match self.rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(AcquireError::Device(format!(
                "'{}' trigger failed: {reason}",
                self.device
            ))),
            Err(_) => Err(AcquireError::Device(format!(
                "'{}' dropped its completion channel mid-exposure",
                self.device
            ))),
        }
    }
}

/// Capability: participation in the stage/trigger/unstage lifecycle
///
/// # Contract
/// - `stage()` on an already-staged device returns `AlreadyStaged`.
/// - `unstage()` is idempotent and releases state even after failures.
/// - `trigger()` on a device with no trigger role returns `Ok(None)`.
#[async_trait]
pub trait Device: Send + Sync {
    /// Stable device name, unique within a session
    fn name(&self) -> &str;

    /// Classification for log context
    fn family(&self) -> DeviceFamily;

    /// Commit configuration to hardware and allocate output state
    async fn stage(&self) -> AppResult<()>;

    /// Release acquisition state
    async fn unstage(&self) -> AppResult<()>;

    /// Whether the device is currently staged
    async fn is_staged(&self) -> AppResult<bool>;

    /// Start an exposure series
    ///
    /// # Returns
    /// A completion handle to await, or `None` when the device takes no
    /// part in triggering.
    async fn trigger(&self) -> AppResult<Option<TriggerHandle>> {
        Ok(None)
    }
}

/// Capability: frame-producing detector with an external data file
///
/// # Contract
/// - `staging_setup()` is pure configuration and must not start hardware.
/// - `images_received()` reflects frames confirmed written, not requested.
/// - `written_file_name()` is only meaningful after a completed series;
///   before that it returns a device error.
#[async_trait]
pub trait AreaDetector: Device {
    /// Apply acquisition parameters for the next staged series
    async fn staging_setup(&self, setup: &StagingSetup) -> AppResult<()>;

    /// Frames the hardware has confirmed captured so far
    async fn images_received(&self) -> AppResult<u32>;

    /// Frames grouped into one logical point on readback
    fn frames_per_point(&self) -> u32 {
        1
    }

    /// Whether this detector needs externally generated trigger pulses
    fn needs_external_pulses(&self) -> bool {
        false
    }

    /// File name the hardware actually wrote for the last completed series
    async fn written_file_name(&self) -> AppResult<String> {
        Err(AcquireError::Device(format!(
            "'{}' does not report written file names",
            self.name()
        )))
    }

    /// Asset documents accumulated for the current or last series
    fn assets(&self) -> &AssetCache;
}

/// Series file name in the `<base>_<begin>-<end>` zero-padded convention
/// shared by the plugin-style writers.
pub(crate) fn series_file_name(base: &str, begin: u32, end: u32) -> String {
    format!("{base}_{begin:05}-{end:05}.imm")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};

    // Minimal shutter-like device: stages, never triggers.
    struct MockShutter {
        staged: AtomicBool,
    }

    #[async_trait]
    impl Device for MockShutter {
        fn name(&self) -> &str {
            "mock_shutter"
        }

        fn family(&self) -> DeviceFamily {
            DeviceFamily::Monitor
        }

        async fn stage(&self) -> AppResult<()> {
            if self.staged.swap(true, Ordering::SeqCst) {
                return Err(AcquireError::AlreadyStaged("mock_shutter".to_string()));
            }
            Ok(())
        }

        async fn unstage(&self) -> AppResult<()> {
            self.staged.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn is_staged(&self) -> AppResult<bool> {
            Ok(self.staged.load(Ordering::SeqCst))
        }
    }

    fn setup() -> StagingSetup {
        StagingSetup {
            file_path: PathBuf::from("/data/xpcs"),
            file_name: "A001_test".to_string(),
            num_images: 100,
            acquire_time: 0.001,
            acquire_period: 0.002,
        }
    }

    #[tokio::test]
    async fn default_trigger_reports_no_participation() {
        let shutter = MockShutter {
            staged: AtomicBool::new(false),
        };
        shutter.stage().await.unwrap();
        assert!(shutter.trigger().await.unwrap().is_none());
        shutter.unstage().await.unwrap();
        assert!(!shutter.is_staged().await.unwrap());
    }

    #[tokio::test]
    async fn double_stage_is_rejected() {
        let shutter = MockShutter {
            staged: AtomicBool::new(false),
        };
        shutter.stage().await.unwrap();
        let err = shutter.stage().await.unwrap_err();
        assert!(matches!(err, AcquireError::AlreadyStaged(_)));
    }

    #[test]
    fn staging_setup_accepts_valid_fields() {
        assert!(setup().validate().is_ok());
    }

    #[test]
    fn staging_setup_rejects_bad_fields() {
        let mut s = setup();
        s.num_images = 0;
        assert!(matches!(
            s.validate().unwrap_err(),
            AcquireError::InvalidArgument(_)
        ));

        let mut s = setup();
        s.acquire_time = 0.0;
        assert!(s.validate().is_err());

        let mut s = setup();
        s.acquire_period = f64::NAN;
        assert!(s.validate().is_err());

        let mut s = setup();
        s.file_name = format!("nested{}name", std::path::MAIN_SEPARATOR);
        assert!(s.validate().is_err());

        let mut s = setup();
        s.file_name.clear();
        assert!(s.validate().is_err());
    }

    #[tokio::test]
    async fn trigger_handle_resolves_success_and_failure() {
        let (handle, tx) = TriggerHandle::channel("det");
        tx.send(Ok(())).ok();
        handle.wait().await.unwrap();

        let (handle, tx) = TriggerHandle::channel("det");
        tx.send(Err("saturated".to_string())).ok();
        let err = handle.wait().await.unwrap_err();
        assert!(err.to_string().contains("saturated"));
    }

    #[tokio::test]
    async fn dropped_completion_channel_is_an_error() {
        let (handle, tx) = TriggerHandle::channel("det");
        drop(tx);
        let err = handle.wait().await.unwrap_err();
        assert!(err.to_string().contains("completion channel"));
    }

    #[test]
    fn series_names_are_zero_padded() {
        assert_eq!(series_file_name("A001_b", 1, 100), "A001_b_00001-00100.imm");
        assert_eq!(
            series_file_name("A001_b", 101, 200),
            "A001_b_00101-00200.imm"
        );
    }
}
