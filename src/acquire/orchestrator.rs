//! Acquisition orchestration state machine.
//!
//! One [`Orchestrator`] serializes all acquisitions on a beamline profile.
//! Each run walks a fixed phase sequence:
//!
//! ```text
//! Idle → Configuring → Staged → Triggering → Acquiring
//!      → Unstaging → MetadataCapture → WorkflowDispatch → Idle
//! ```
//!
//! Failure in any phase moves to `Failed`, runs the unconditional unstage
//! pass, and only then propagates the error.
//!
//! # Ordering Guarantees
//!
//! - Pre-scan metadata is written before any trigger fires, so transient
//!   readbacks (ring current, sample position) reflect the moment the
//!   acquisition begins.
//! - Every `stage()` completes before the first `trigger()` is issued.
//! - Every trigger is issued before the first completion wait begins.
//! - External pulse generation starts after the detector's own trigger,
//!   so the detector is armed for the first pulse edge.
//! - `unstage()` is attempted on every device regardless of outcome.
//!
//! The registry is rebuilt at the start of each run: every field read
//! downstream was written in this run's pre/post window, never inherited
//! from a previous acquisition.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::device::{Device, PulseGenerator, TriggerHandle};
use crate::error::{AcquireError, AppResult};
use crate::metadata::{
    fields, free_artifact_path, DetectorTable, MetadataArtifact, MetadataRegistry,
};
use crate::signal::Signal;
use crate::workflow::{DispatchLedger, DispatchMode, WorkflowBridge};

use super::documents::{now_ns, AssetBundle, Document, RunStartDoc, RunStopDoc};
use super::request::AcquisitionRequest;
use super::session::DetectorSession;

/// Phase of the acquisition state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirePhase {
    /// No acquisition in flight
    Idle,
    /// Request validation and device configuration
    Configuring,
    /// Configuration applied, pre-scan metadata being captured
    Staged,
    /// Run opened, devices staging and triggers being issued
    Triggering,
    /// Waiting on exposure completion
    Acquiring,
    /// Releasing device state
    Unstaging,
    /// Post-scan metadata capture and asset collection
    MetadataCapture,
    /// Artifact written, external pipeline being invoked
    WorkflowDispatch,
    /// Last acquisition ended in an error
    Failed,
}

impl AcquirePhase {
    /// Lowercase label for log fields
    pub fn label(&self) -> &'static str {
        match self {
            AcquirePhase::Idle => "idle",
            AcquirePhase::Configuring => "configuring",
            AcquirePhase::Staged => "staged",
            AcquirePhase::Triggering => "triggering",
            AcquirePhase::Acquiring => "acquiring",
            AcquirePhase::Unstaging => "unstaging",
            AcquirePhase::MetadataCapture => "metadata_capture",
            AcquirePhase::WorkflowDispatch => "workflow_dispatch",
            AcquirePhase::Failed => "failed",
        }
    }
}

/// Beamline readbacks sampled into the pre- and post-scan metadata windows
#[derive(Debug, Clone)]
pub struct BeamlineSignals {
    /// Storage-ring current, sampled at run begin and end
    pub ring_current: Signal<f64>,
    pub sample_x: Signal<f64>,
    pub sample_y: Signal<f64>,
    pub sample_z: Signal<f64>,
    pub temperature_setpoint: Signal<f64>,
    pub temperature_actual: Signal<f64>,
}

impl Default for BeamlineSignals {
    fn default() -> Self {
        Self {
            ring_current: Signal::new("ring_current", 102.0).with_units("mA"),
            sample_x: Signal::new("sample_x", 0.0).with_units("mm"),
            sample_y: Signal::new("sample_y", 0.0).with_units("mm"),
            sample_z: Signal::new("sample_z", 0.0).with_units("mm"),
            temperature_setpoint: Signal::new("temperature_setpoint", 295.0).with_units("K"),
            temperature_actual: Signal::new("temperature_actual", 295.0).with_units("K"),
        }
    }
}

/// What one completed acquisition produced
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Unique run identifier
    pub run_uid: String,
    /// Sequential scan number
    pub scan_id: u64,
    /// Datums recorded by the detector
    pub datum_count: u32,
    /// File name the hardware reported writing, when it reports one
    pub written_file: Option<String>,
    /// Metadata artifact location
    pub artifact_path: PathBuf,
    /// Documents emitted for this run, start through stop
    pub documents: Vec<Document>,
    /// Wall time from request validation to dispatch
    pub elapsed: Duration,
}

struct ActiveRun {
    run_uid: String,
    scan_id: u64,
}

/// Serializes acquisitions over one detector session at a time.
///
/// Owns the metadata registry, the physical-parameter table, and the
/// workflow bridge. Taking `&mut self` for [`Orchestrator::acquire`] is
/// what rules out concurrent acquisitions on one registry.
pub struct Orchestrator {
    registry: MetadataRegistry,
    table: DetectorTable,
    bridge: WorkflowBridge,
    beamline: BeamlineSignals,
    pulse: Option<Arc<PulseGenerator>>,
    acquire_timeout: Duration,
    scan_id: u64,
    phase: AcquirePhase,
    documents: Vec<Document>,
    active_run: Option<ActiveRun>,
}

impl Orchestrator {
    pub fn new(settings: &Settings) -> Self {
        Self {
            registry: MetadataRegistry::new(),
            table: DetectorTable::from_settings(settings),
            bridge: WorkflowBridge::from_config(&settings.workflow),
            beamline: BeamlineSignals::default(),
            pulse: None,
            acquire_timeout: settings.acquisition.acquire_timeout,
            scan_id: settings.acquisition.scan_id_start,
            phase: AcquirePhase::Idle,
            documents: Vec::new(),
            active_run: None,
        }
    }

    /// Wire in real beamline readbacks instead of the defaults
    pub fn with_beamline(mut self, beamline: BeamlineSignals) -> Self {
        self.beamline = beamline;
        self
    }

    /// Attach the pulse generator used by externally triggered detectors
    pub fn with_pulse_generator(mut self, pulse: Arc<PulseGenerator>) -> Self {
        self.pulse = Some(pulse);
        self
    }

    /// Registry holding the current run's metadata fields
    pub fn registry(&self) -> &MetadataRegistry {
        &self.registry
    }

    /// Beamline readbacks the pre/post-scan windows sample
    pub fn beamline(&self) -> &BeamlineSignals {
        &self.beamline
    }

    pub fn phase(&self) -> AcquirePhase {
        self.phase
    }

    /// Scan number the next acquisition will use
    pub fn next_scan_id(&self) -> u64 {
        self.scan_id
    }

    /// Every document emitted since this orchestrator was created
    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// Outcomes of past workflow dispatches
    pub fn dispatch_ledger(&self) -> DispatchLedger {
        self.bridge.ledger()
    }

    /// Wait until every workflow dispatch issued so far has concluded.
    ///
    /// Returns `false` on timeout. Dispatch never blocks [`Self::acquire`];
    /// one-shot callers drain here before process exit so runtime teardown
    /// cannot cancel a dispatch mid-retry and drop its ledger record.
    pub async fn drain_dispatches(&self, timeout: Duration) -> bool {
        self.bridge.wait_idle(timeout).await
    }

    /// Run one acquisition end to end.
    ///
    /// `monitors` are staged alongside the detector and unstaged with it;
    /// devices without a trigger role are simply never waited on.
    ///
    /// # Errors
    /// Pre-hardware errors (`Configuration`) abort before any device is
    /// staged. Later failures propagate only after the unconditional
    /// unstage pass.
    pub async fn acquire(
        &mut self,
        session: &DetectorSession,
        request: &AcquisitionRequest,
        monitors: &[Arc<dyn Device>],
    ) -> AppResult<RunSummary> {
        let started = Instant::now();
        match self.run(session, request, monitors, started).await {
            Ok(summary) => {
                self.phase = AcquirePhase::Idle;
                Ok(summary)
            }
            Err(e) => {
                let failed_in = self.phase;
                self.phase = AcquirePhase::Failed;
                error!(
                    detector = session.name(),
                    phase = failed_in.label(),
                    error = %e,
                    "acquisition failed"
                );
                if !e.is_pre_hardware() {
                    let _ = self.unstage_all(session, monitors).await;
                    self.stop_pulses().await;
                }
                if let Some(run) = self.active_run.take() {
                    warn!(run_uid = %run.run_uid, scan_id = run.scan_id, "closing failed run");
                    let mut bundle = session.detector().assets().drain();
                    bundle.stamp_run(&run.run_uid);
                    let datum_count = bundle.datum_count();
                    self.push_bundle(bundle);
                    self.documents.push(Document::RunStop(RunStopDoc::fail(
                        &run.run_uid,
                        &e.to_string(),
                        datum_count,
                    )));
                }
                Err(e)
            }
        }
    }

    async fn run(
        &mut self,
        session: &DetectorSession,
        request: &AcquisitionRequest,
        monitors: &[Arc<dyn Device>],
        started: Instant,
    ) -> AppResult<RunSummary> {
        // ---- Configuring: nothing here touches hardware state beyond the
        // pure staging_setup call.
        self.phase = AcquirePhase::Configuring;
        request.validate()?;
        let detector = session.detector();
        if detector.needs_external_pulses() && self.pulse.is_none() {
            return Err(AcquireError::Configuration(format!(
                "detector '{}' needs external pulses but no pulse generator is attached",
                detector.name()
            )));
        }

        // Fresh registry per run: stale fields from a previous acquisition
        // must never leak into this one's artifact.
        self.registry = MetadataRegistry::new();
        self.registry
            .set_u32(fields::DETECTOR_NUMBER, session.number());
        if let Some(qmap) = session.qmap() {
            self.registry
                .set_str(fields::QMAP_FILE, qmap.display().to_string());
        }
        detector.staging_setup(&request.staging_setup()).await?;
        info!(
            detector = session.name(),
            mode = %session.mode().label(),
            file_name = %request.file_name,
            num_images = request.num_images,
            "acquisition configured"
        );

        // ---- Staged: pre-scan metadata window
        self.phase = AcquirePhase::Staged;
        self.capture_pre_scan(session, request);

        // ---- Triggering: open the run, stage everything, then fire
        self.phase = AcquirePhase::Triggering;
        let scan_id = self.scan_id;
        self.scan_id += 1;
        let mut start = RunStartDoc::new(scan_id, "xpcs_acquire", &request.sample_name)
            .with_detector(session.name());
        for monitor in monitors {
            start.detectors.push(monitor.name().to_string());
        }
        for (key, value) in &request.metadata {
            start.metadata.insert(key.clone(), value.clone());
        }
        let run_uid = start.uid.clone();
        let doc_mark = self.documents.len();
        self.documents.push(Document::RunStart(start));
        self.active_run = Some(ActiveRun {
            run_uid: run_uid.clone(),
            scan_id,
        });
        info!(run_uid = %run_uid, scan_id, "run open");

        // All stages complete before any trigger is issued. Monitors have
        // no ordering constraints among themselves and stage concurrently.
        detector.stage().await?;
        try_join_all(monitors.iter().map(|monitor| monitor.stage())).await?;

        // All triggers are issued before any wait begins.
        let mut handles: Vec<TriggerHandle> = Vec::new();
        if let Some(handle) = detector.trigger().await? {
            handles.push(handle);
        }
        for monitor in monitors {
            if let Some(handle) = monitor.trigger().await? {
                handles.push(handle);
            }
        }

        // The detector is armed now; pulse edges may start arriving.
        let mut pulses_started = false;
        if detector.needs_external_pulses() {
            if let Some(pulse) = &self.pulse {
                pulse.start().await?;
                pulses_started = true;
            }
        }

        // ---- Acquiring
        self.phase = AcquirePhase::Acquiring;
        if handles.is_empty() {
            debug!("no device took a trigger role; skipping the completion wait");
        }
        for handle in handles {
            let device = handle.device().to_string();
            match tokio::time::timeout(self.acquire_timeout, handle.wait()).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(AcquireError::Device(format!(
                        "'{device}' did not complete within {:?}",
                        self.acquire_timeout
                    )));
                }
            }
        }
        if pulses_started {
            self.stop_pulses().await;
        }

        // ---- Unstaging: the same pass the failure path runs
        self.phase = AcquirePhase::Unstaging;
        self.unstage_all(session, monitors).await?;

        // ---- MetadataCapture: post-scan window
        self.phase = AcquirePhase::MetadataCapture;
        let written = match detector.written_file_name().await {
            Ok(name) => Some(name),
            Err(e) => {
                debug!(detector = detector.name(), error = %e, "no written file name reported");
                None
            }
        };
        self.capture_post_scan(&run_uid, scan_id, written.as_deref());

        let mut bundle = detector.assets().drain();
        bundle.stamp_run(&run_uid);
        let datum_count = bundle.datum_count();
        self.push_bundle(bundle);

        // ---- WorkflowDispatch: artifact to disk, pipeline fired, run closed
        self.phase = AcquirePhase::WorkflowDispatch;
        let stem = artifact_stem(&request.file_name, written.as_deref());
        let artifact_path = free_artifact_path(&request.data_path, &stem, artifact_extension());
        let number = self.registry.get_u32(fields::DETECTOR_NUMBER)?;
        let physical = self.table.get(number)?;
        let artifact = MetadataArtifact::build(&self.registry, physical);
        write_artifact(&artifact, &artifact_path)?;
        info!(path = %artifact_path.display(), "metadata artifact written");

        self.active_run = None;
        self.documents
            .push(Document::RunStop(RunStopDoc::success(&run_uid, datum_count)));

        let mode = DispatchMode::from_analysis_flag(request.submit_for_analysis);
        let qmap = session.qmap();
        let _dispatch = self.bridge.dispatch(&artifact_path, qmap.as_deref(), mode);

        let elapsed = started.elapsed();
        info!(run_uid = %run_uid, scan_id, datum_count, ?elapsed, "run closed");
        Ok(RunSummary {
            run_uid,
            scan_id,
            datum_count,
            written_file: written,
            artifact_path,
            documents: self.documents[doc_mark..].to_vec(),
            elapsed,
        })
    }

    fn capture_pre_scan(&self, session: &DetectorSession, request: &AcquisitionRequest) {
        let registry = &self.registry;
        let (rows, cols) = session.geometry();
        registry.set_u32(fields::DETECTOR_ROWS, rows);
        registry.set_u32(fields::DETECTOR_COLS, cols);

        registry.set_str(fields::PARENT_FOLDER, request.data_path.display().to_string());
        registry.set_str(fields::DATA_FILE_NAME, request.file_name.clone());
        registry.set_u32(fields::NUM_FRAMES, request.num_images);
        registry.set_f64(fields::EXPOSURE_TIME, request.acquire_time);
        registry.set_f64(fields::EXPOSURE_PERIOD, request.acquire_period);
        registry.set_u32(fields::ATTENUATION, request.attenuation);

        registry.set_str(fields::SAMPLE_NAME, request.sample_name.clone());
        registry.set_f64(fields::SAMPLE_X, self.beamline.sample_x.get());
        registry.set_f64(fields::SAMPLE_Y, self.beamline.sample_y.get());
        registry.set_f64(fields::SAMPLE_Z, self.beamline.sample_z.get());
        registry.set_f64(
            fields::TEMPERATURE_SETPOINT,
            self.beamline.temperature_setpoint.get(),
        );
        registry.set_f64(
            fields::TEMPERATURE_ACTUAL,
            self.beamline.temperature_actual.get(),
        );

        registry.set_f64(fields::CURRENT_BEGIN, self.beamline.ring_current.get());
        registry.set_u64(fields::TIME_BEGIN_NS, now_ns());

        match session.roi() {
            Some(roi) => {
                registry.set_u32(fields::ROI_ENABLED, 1);
                registry.set_u32(fields::ROI_X_BEGIN, roi.x_begin);
                registry.set_u32(fields::ROI_X_END, roi.x_end);
                registry.set_u32(fields::ROI_Y_BEGIN, roi.y_begin);
                registry.set_u32(fields::ROI_Y_END, roi.y_end);
            }
            None => registry.set_u32(fields::ROI_ENABLED, 0),
        }
        match session.kinetics() {
            Some(kinetics) => {
                registry.set_u32(fields::KINETICS_ENABLED, 1);
                registry.set_u32(fields::KINETICS_WINDOW_SIZE, kinetics.window_size);
                registry.set_u32(fields::KINETICS_TOP, kinetics.top);
            }
            None => registry.set_u32(fields::KINETICS_ENABLED, 0),
        }
        match session.burst() {
            Some(burst) => {
                registry.set_u32(fields::BURST_ENABLED, 1);
                registry.set_u32(fields::BURST_COUNT, burst.count);
                registry.set_u32(fields::BURST_FIRST_USABLE, burst.first_usable);
                registry.set_u32(fields::BURST_LAST_USABLE, burst.last_usable);
            }
            None => registry.set_u32(fields::BURST_ENABLED, 0),
        }
    }

    fn capture_post_scan(&self, run_uid: &str, scan_id: u64, written: Option<&str>) {
        self.registry
            .set_f64(fields::CURRENT_END, self.beamline.ring_current.get());
        self.registry.set_u64(fields::TIME_END_NS, now_ns());
        self.registry.set_str(fields::RUN_UID, run_uid);
        self.registry.set_u64(fields::SCAN_ID, scan_id);
        if let Some(written) = written {
            self.registry.set_str(fields::WRITTEN_FILE_NAME, written);
        }
    }

    /// Unstage every participant, attempting all of them before reporting
    /// the first failure.
    async fn unstage_all(
        &self,
        session: &DetectorSession,
        monitors: &[Arc<dyn Device>],
    ) -> AppResult<()> {
        let mut first_error = None;
        let detector = session.detector();
        if let Err(e) = detector.unstage().await {
            warn!(device = detector.name(), error = %e, "unstage failed");
            first_error.get_or_insert(e);
        }
        for monitor in monitors {
            if let Err(e) = monitor.unstage().await {
                warn!(device = monitor.name(), error = %e, "unstage failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn stop_pulses(&self) {
        if let Some(pulse) = &self.pulse {
            if pulse.is_enabled() {
                if let Err(e) = pulse.stop().await {
                    warn!(error = %e, "pulse generator stop failed");
                }
            }
        }
    }

    fn push_bundle(&mut self, bundle: AssetBundle) {
        if let Some(resource) = bundle.resource {
            self.documents.push(Document::Resource(resource));
        }
        for datum in bundle.datums {
            self.documents.push(Document::Datum(datum));
        }
    }
}

/// Artifact base name derived from the container the hardware wrote.
///
/// Series names carry five-digit frame ranges (`A001_00001-00050.imm`);
/// the artifact convention re-pads the same range to four digits
/// (`A001_0001-0050`). Falls back to the request's base name when the
/// detector reported nothing.
fn artifact_stem(file_name: &str, written: Option<&str>) -> String {
    let Some(written) = written else {
        return file_name.to_string();
    };
    let stem = written.strip_suffix(".imm").unwrap_or(written);
    if let Some((base, range)) = stem.rsplit_once('_') {
        if let Some((begin, end)) = range.split_once('-') {
            if let (Ok(begin), Ok(end)) = (begin.parse::<u32>(), end.parse::<u32>()) {
                return format!("{base}_{begin:04}-{end:04}");
            }
        }
    }
    stem.to_string()
}

fn artifact_extension() -> &'static str {
    if cfg!(feature = "storage_hdf5") {
        "hdf"
    } else {
        "json"
    }
}

#[cfg(feature = "storage_hdf5")]
fn write_artifact(artifact: &MetadataArtifact, path: &Path) -> AppResult<()> {
    artifact.write_hdf5(path)
}

#[cfg(not(feature = "storage_hdf5"))]
fn write_artifact(artifact: &MetadataArtifact, path: &Path) -> AppResult<()> {
    artifact.write_json(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::documents::AssetCache;
    use crate::acquire::session::AcquisitionMode;
    use crate::device::{
        AreaDetector, DeviceFamily, MonitorDevice, SimDetector, StagingSetup,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tracing_test::traced_test;

    /// Scriptable detector for exercising failure paths.
    struct ScriptedDetector {
        name: String,
        fail_trigger: bool,
        hang: bool,
        written: Option<String>,
        staged: AtomicBool,
        stage_calls: AtomicU32,
        unstage_calls: AtomicU32,
        pending: parking_lot::Mutex<Option<tokio::sync::oneshot::Sender<Result<(), String>>>>,
        assets: AssetCache,
    }

    impl ScriptedDetector {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                fail_trigger: false,
                hang: false,
                written: None,
                staged: AtomicBool::new(false),
                stage_calls: AtomicU32::new(0),
                unstage_calls: AtomicU32::new(0),
                pending: parking_lot::Mutex::new(None),
                assets: AssetCache::new(),
            }
        }

        fn failing(name: &str) -> Self {
            Self {
                fail_trigger: true,
                ..Self::new(name)
            }
        }

        fn hanging(name: &str) -> Self {
            Self {
                hang: true,
                ..Self::new(name)
            }
        }

        fn with_written(mut self, written: &str) -> Self {
            self.written = Some(written.to_string());
            self
        }
    }

    #[async_trait]
    impl Device for ScriptedDetector {
        fn name(&self) -> &str {
            &self.name
        }

        fn family(&self) -> DeviceFamily {
            DeviceFamily::Simulated
        }

        async fn stage(&self) -> AppResult<()> {
            self.stage_calls.fetch_add(1, Ordering::SeqCst);
            self.staged.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn unstage(&self) -> AppResult<()> {
            self.unstage_calls.fetch_add(1, Ordering::SeqCst);
            self.staged.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn is_staged(&self) -> AppResult<bool> {
            Ok(self.staged.load(Ordering::SeqCst))
        }

        async fn trigger(&self) -> AppResult<Option<TriggerHandle>> {
            if self.fail_trigger {
                return Err(AcquireError::Device(format!(
                    "'{}' refused to trigger",
                    self.name
                )));
            }
            if self.hang {
                let (handle, tx) = TriggerHandle::channel(self.name.clone());
                // Keep the sender alive so the wait times out instead of
                // seeing a dropped channel.
                *self.pending.lock() = Some(tx);
                return Ok(Some(handle));
            }
            Ok(None)
        }
    }

    #[async_trait]
    impl AreaDetector for ScriptedDetector {
        async fn staging_setup(&self, setup: &StagingSetup) -> AppResult<()> {
            setup.validate()
        }

        async fn images_received(&self) -> AppResult<u32> {
            Ok(0)
        }

        async fn written_file_name(&self) -> AppResult<String> {
            match &self.written {
                Some(name) => Ok(name.clone()),
                None => Err(AcquireError::Device("nothing written".to_string())),
            }
        }

        fn assets(&self) -> &AssetCache {
            &self.assets
        }
    }

    fn sim_session(name: &str, dir_rows: u32) -> DetectorSession {
        let detector = Arc::new(
            SimDetector::new(name, dir_rows, 16).with_frame_interval(Duration::from_millis(1)),
        );
        DetectorSession::new(25, name, AcquisitionMode::internal(), detector)
            .with_geometry(dir_rows, 16)
    }

    fn expected_artifact(stem: &str) -> String {
        format!("{stem}.{}", artifact_extension())
    }

    #[tokio::test]
    async fn full_acquisition_produces_assets_and_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut orchestrator = Orchestrator::new(&Settings::default());
        let session = sim_session("sim_lambda", 16);
        let request = AcquisitionRequest::new(dir.path(), "A001", 0.001, 0.002, 5)
            .with_sample_name("latex_sphere");

        let summary = orchestrator.acquire(&session, &request, &[]).await.unwrap();

        assert_eq!(summary.scan_id, 1);
        assert_eq!(summary.datum_count, 5);
        assert_eq!(
            summary.written_file.as_deref(),
            Some("A001_00001-00005.imm")
        );
        assert!(summary.artifact_path.exists());
        assert_eq!(
            summary.artifact_path.file_name().unwrap().to_str().unwrap(),
            expected_artifact("A001_0001-0005")
        );
        assert_eq!(orchestrator.phase(), AcquirePhase::Idle);
        assert_eq!(orchestrator.next_scan_id(), 2);

        // Document stream brackets the run and links every datum to it.
        assert!(matches!(
            summary.documents.first(),
            Some(Document::RunStart(_))
        ));
        assert!(matches!(
            summary.documents.last(),
            Some(Document::RunStop(d)) if d.exit_status == "success"
        ));
        let datums = summary
            .documents
            .iter()
            .filter(|d| matches!(d, Document::Datum(_)))
            .count();
        assert_eq!(datums, 5);
        assert!(summary
            .documents
            .iter()
            .skip(1)
            .all(|d| d.run_uid() == summary.run_uid));

        // Post-scan registry fields are this run's, not leftovers.
        let registry = orchestrator.registry();
        assert_eq!(registry.get_str(fields::RUN_UID).unwrap(), summary.run_uid);
        assert_eq!(registry.get_u64(fields::SCAN_ID).unwrap(), 1);
        assert!(!session.detector().is_staged().await.unwrap());
    }

    #[tokio::test]
    async fn second_run_advances_scan_id_and_frame_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut orchestrator = Orchestrator::new(&Settings::default());
        let session = sim_session("sim_lambda", 16);
        let request = AcquisitionRequest::new(dir.path(), "A001", 0.001, 0.002, 3);

        let first = orchestrator.acquire(&session, &request, &[]).await.unwrap();
        let second = orchestrator.acquire(&session, &request, &[]).await.unwrap();

        assert_eq!(first.scan_id, 1);
        assert_eq!(second.scan_id, 2);
        assert_eq!(second.written_file.as_deref(), Some("A001_00004-00006.imm"));
        assert_eq!(
            second.artifact_path.file_name().unwrap().to_str().unwrap(),
            expected_artifact("A001_0004-0006")
        );
        assert_ne!(first.run_uid, second.run_uid);
    }

    #[tokio::test]
    async fn trigger_failure_still_unstages_every_device() {
        let dir = tempfile::tempdir().unwrap();
        let mut orchestrator = Orchestrator::new(&Settings::default());
        let detector = Arc::new(ScriptedDetector::failing("flaky"));
        let session = DetectorSession::new(
            25,
            "flaky",
            AcquisitionMode::internal(),
            Arc::clone(&detector) as Arc<dyn AreaDetector>,
        );
        let ring = MonitorDevice::new(
            "ring_monitor",
            orchestrator.beamline().ring_current.clone(),
        );
        let monitors: Vec<Arc<dyn Device>> = vec![Arc::new(ring)];
        let request = AcquisitionRequest::new(dir.path(), "A001", 0.001, 0.002, 3);

        let err = orchestrator
            .acquire(&session, &request, &monitors)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("refused to trigger"));
        assert_eq!(orchestrator.phase(), AcquirePhase::Failed);

        // Exactly one unstage per staged device, and nothing left staged.
        assert_eq!(detector.stage_calls.load(Ordering::SeqCst), 1);
        assert_eq!(detector.unstage_calls.load(Ordering::SeqCst), 1);
        assert!(!monitors[0].is_staged().await.unwrap());

        // The run closed with a fail stop document.
        assert!(matches!(
            orchestrator.documents().last(),
            Some(Document::RunStop(d)) if d.exit_status == "fail"
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn failures_are_logged_with_the_phase_they_happened_in() {
        let dir = tempfile::tempdir().unwrap();
        let mut orchestrator = Orchestrator::new(&Settings::default());
        let detector = Arc::new(ScriptedDetector::failing("flaky"));
        let session = DetectorSession::new(
            25,
            "flaky",
            AcquisitionMode::internal(),
            Arc::clone(&detector) as Arc<dyn AreaDetector>,
        );
        let request = AcquisitionRequest::new(dir.path(), "A001", 0.001, 0.002, 3);

        let _ = orchestrator.acquire(&session, &request, &[]).await;

        assert!(logs_contain("acquisition failed"));
        assert!(logs_contain("triggering"));
        // The failed run is closed under its identity
        assert!(logs_contain("closing failed run"));
        assert!(logs_contain("scan_id=1"));
    }

    #[tokio::test]
    async fn configuration_errors_abort_before_hardware() {
        let mut orchestrator = Orchestrator::new(&Settings::default());
        let detector = Arc::new(ScriptedDetector::new("untouched"));
        let session = DetectorSession::new(
            25,
            "untouched",
            AcquisitionMode::internal(),
            Arc::clone(&detector) as Arc<dyn AreaDetector>,
        );
        let request = AcquisitionRequest::new("", "A001", 0.001, 0.002, 3);

        let err = orchestrator.acquire(&session, &request, &[]).await.unwrap_err();
        assert!(matches!(err, AcquireError::Configuration(_)));
        assert_eq!(detector.stage_calls.load(Ordering::SeqCst), 0);
        assert_eq!(detector.unstage_calls.load(Ordering::SeqCst), 0);
        assert!(orchestrator.documents().is_empty());
    }

    #[tokio::test]
    async fn completion_wait_is_bounded_by_the_acquire_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.acquisition.acquire_timeout = Duration::from_millis(50);
        let mut orchestrator = Orchestrator::new(&settings);
        let detector = Arc::new(ScriptedDetector::hanging("stuck"));
        let session = DetectorSession::new(
            25,
            "stuck",
            AcquisitionMode::internal(),
            Arc::clone(&detector) as Arc<dyn AreaDetector>,
        );
        let request = AcquisitionRequest::new(dir.path(), "A001", 0.001, 0.002, 3);

        let err = orchestrator.acquire(&session, &request, &[]).await.unwrap_err();
        assert!(err.to_string().contains("did not complete"));
        assert_eq!(detector.unstage_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pure_monitoring_run_skips_the_wait_and_reuses_collided_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut orchestrator = Orchestrator::new(&Settings::default());
        // Never triggers, always reports the same written name, so the
        // second run must pick a suffixed artifact path.
        let detector =
            Arc::new(ScriptedDetector::new("monitor_only").with_written("A001_00001-00003.imm"));
        let session = DetectorSession::new(
            25,
            "monitor_only",
            AcquisitionMode::internal(),
            Arc::clone(&detector) as Arc<dyn AreaDetector>,
        );
        let request = AcquisitionRequest::new(dir.path(), "A001", 0.001, 0.002, 3);

        let first = orchestrator.acquire(&session, &request, &[]).await.unwrap();
        let second = orchestrator.acquire(&session, &request, &[]).await.unwrap();

        assert_eq!(first.datum_count, 0);
        assert_eq!(
            first.artifact_path.file_name().unwrap().to_str().unwrap(),
            expected_artifact("A001_0001-0003")
        );
        assert_eq!(
            second.artifact_path.file_name().unwrap().to_str().unwrap(),
            expected_artifact("A001_0001-0003_1")
        );
        assert!(first.artifact_path.exists());
        assert!(second.artifact_path.exists());
    }

    #[tokio::test]
    async fn external_pulse_detectors_require_a_generator() {
        let dir = tempfile::tempdir().unwrap();
        let mut orchestrator = Orchestrator::new(&Settings::default());
        let detector = Arc::new(
            SimDetector::new("pulsed", 16, 16)
                .with_frame_interval(Duration::from_millis(1))
                .with_external_pulses(),
        );
        let session = DetectorSession::new(25, "pulsed", AcquisitionMode::external(), detector);
        let request = AcquisitionRequest::new(dir.path(), "A001", 0.001, 0.002, 2);

        let err = orchestrator.acquire(&session, &request, &[]).await.unwrap_err();
        assert!(matches!(err, AcquireError::Configuration(_)));

        // With a generator attached the same session acquires fine.
        let mut orchestrator = Orchestrator::new(&Settings::default()).with_pulse_generator(
            Arc::new(PulseGenerator::new("pulse_gen", Duration::from_millis(5))),
        );
        let summary = orchestrator.acquire(&session, &request, &[]).await.unwrap();
        assert_eq!(summary.datum_count, 2);
    }

    #[test]
    fn artifact_stems_repad_the_series_range() {
        assert_eq!(
            artifact_stem("A001", Some("A001_00001-00050.imm")),
            "A001_0001-0050"
        );
        assert_eq!(
            artifact_stem("A001", Some("A001_b_00101-00200.imm")),
            "A001_b_0101-0200"
        );
        assert_eq!(artifact_stem("A001", None), "A001");
        assert_eq!(artifact_stem("A001", Some("burst_output.imm")), "burst_output");
    }
}
