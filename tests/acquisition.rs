//! End-to-end acquisition integration tests
//!
//! Drives the full orchestrated sequence against the simulated detector:
//! staging, triggering, frame writing, document emission, metadata capture,
//! and artifact construction.
//!
//! # Test Coverage
//!
//! - Full 50-frame acquisition: container, document stream, artifact
//! - Document linkage (run start first, resource before its datums, stop last)
//! - Container read-back through the IMM index
//! - Beamline monitor sampling across the staged window
//! - Workflow handoff drained to its ledger record before the caller exits
//! - Configuration-driven detector sessions (qmap, physical overrides)
//! - Artifact tree content (JSON rendition; HDF5 layout when enabled)
//!
//! # Feature Gates
//!
//! With `storage_hdf5` enabled the metadata artifact is written as HDF5 and
//! the JSON tree assertions are skipped in favor of group-structure checks.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use xpcs_daq::acquire::{
    AcquisitionMode, AcquisitionRequest, DetectorSession, Document, Orchestrator,
};
use xpcs_daq::config::Settings;
use xpcs_daq::device::{AreaDetector, Device, MonitorDevice, SimDetector};
use xpcs_daq::imm::{Compression, ImmReader};
use xpcs_daq::metadata::fields;

// =============================================================================
// Test Helper Functions
// =============================================================================

/// Settings with workflow dispatch pointed at a no-op command so background
/// tasks exit immediately.
fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.workflow.command = "true".to_string();
    settings.workflow.max_attempts = 1;
    settings.workflow.retry_backoff = Duration::from_millis(10);
    settings
}

/// Request sized so a full run completes in milliseconds.
fn fast_request(dir: &Path, num_images: u32) -> AcquisitionRequest {
    AcquisitionRequest::new(dir, "A001", 0.001, 0.002, num_images)
        .with_sample_name("aerogel")
        .with_metadata("proposal", "GUP-12345")
}

/// Simulated detector geometry used throughout: 64 rows x 48 cols.
fn sim_session(name: &str) -> (Arc<dyn AreaDetector>, DetectorSession) {
    let detector: Arc<dyn AreaDetector> = Arc::new(
        SimDetector::new(name, 64, 48)
            .with_mean_photons(32)
            .with_frame_interval(Duration::ZERO),
    );
    let session = DetectorSession::new(
        25,
        name,
        AcquisitionMode::internal(),
        Arc::clone(&detector),
    )
    .with_geometry(64, 48);
    (detector, session)
}

fn artifact_name(stem: &str) -> String {
    if cfg!(feature = "storage_hdf5") {
        format!("{stem}.hdf")
    } else {
        format!("{stem}.json")
    }
}

// =============================================================================
// Full Acquisition Flow
// =============================================================================

#[tokio::test]
async fn full_acquisition_emits_documents_container_and_artifact() {
    let dir = TempDir::new().unwrap();
    let (_detector, session) = sim_session("lambda2m");

    let mut orchestrator = Orchestrator::new(&test_settings());
    let monitor = Arc::new(MonitorDevice::new(
        "ring_current_monitor",
        orchestrator.beamline().ring_current.clone(),
    ));
    let monitors: Vec<Arc<dyn Device>> = vec![monitor.clone()];

    let request = fast_request(dir.path(), 50);
    let summary = orchestrator
        .acquire(&session, &request, &monitors)
        .await
        .unwrap();

    assert_eq!(summary.scan_id, 1);
    assert_eq!(summary.datum_count, 50);
    assert_eq!(summary.written_file.as_deref(), Some("A001_00001-00050.imm"));

    // Container is on disk and indexable: 50 sparse frames at 64x48
    let container = dir.path().join("A001_00001-00050.imm");
    assert!(container.exists(), "detector should write the series file");
    let reader = ImmReader::open(&container, 1).unwrap();
    assert_eq!(reader.frame_count(), 50);
    assert_eq!(reader.point_count(), 50);
    assert_eq!(reader.rows(), 64);
    assert_eq!(reader.cols(), 48);
    assert_eq!(reader.compression(), Compression::Sparse);

    // Document stream: start, one resource, 50 datums, then stop
    let docs = &summary.documents;
    assert!(matches!(docs.first(), Some(Document::RunStart(_))));
    assert!(matches!(docs.last(), Some(Document::RunStop(_))));

    let resources: Vec<_> = docs
        .iter()
        .filter_map(|d| match d {
            Document::Resource(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].run_uid, summary.run_uid);
    assert_eq!(resources[0].spec, "IMM");
    assert_eq!(resources[0].resource_path, "A001_00001-00050.imm");
    assert_eq!(resources[0].root, dir.path());

    let datums: Vec<_> = docs
        .iter()
        .filter_map(|d| match d {
            Document::Datum(datum) => Some(datum),
            _ => None,
        })
        .collect();
    assert_eq!(datums.len(), 50);
    for (index, datum) in datums.iter().enumerate() {
        assert_eq!(datum.point_index, index as u32);
        assert_eq!(datum.resource_uid, resources[0].uid);
        assert_eq!(datum.run_uid, summary.run_uid);
        assert_eq!(datum.uid, format!("{}/{}", resources[0].uid, index));
    }

    if let Some(Document::RunStart(start)) = docs.first() {
        assert_eq!(start.uid, summary.run_uid);
        assert_eq!(start.scan_id, 1);
        assert_eq!(start.sample_name, "aerogel");
        assert!(start.detectors.contains(&"lambda2m".to_string()));
        assert_eq!(start.metadata.get("proposal").unwrap(), "GUP-12345");
    }
    if let Some(Document::RunStop(stop)) = docs.last() {
        assert_eq!(stop.run_uid, summary.run_uid);
        assert_eq!(stop.exit_status, "success");
        assert_eq!(stop.num_datums, 50);
    }

    // Monitor sampled the ring current across the staged window
    assert!(monitor.sample_count() >= 1);

    // Artifact stem re-pads the series range to four digits
    let expected = dir.path().join(artifact_name("A001_0001-0050"));
    assert_eq!(summary.artifact_path, expected);
    assert!(summary.artifact_path.exists());
}

#[tokio::test]
async fn back_to_back_runs_extend_the_series_and_advance_scan_ids() {
    let dir = TempDir::new().unwrap();
    let (_detector, session) = sim_session("lambda2m");
    let mut orchestrator = Orchestrator::new(&test_settings());

    let first = orchestrator
        .acquire(&session, &fast_request(dir.path(), 4), &[])
        .await
        .unwrap();
    let second = orchestrator
        .acquire(&session, &fast_request(dir.path(), 4), &[])
        .await
        .unwrap();

    assert_eq!(first.scan_id, 1);
    assert_eq!(second.scan_id, 2);
    assert_ne!(first.run_uid, second.run_uid);

    // Frame numbering continues where the previous run stopped
    assert_eq!(first.written_file.as_deref(), Some("A001_00001-00004.imm"));
    assert_eq!(second.written_file.as_deref(), Some("A001_00005-00008.imm"));
    assert_eq!(
        second.artifact_path,
        dir.path().join(artifact_name("A001_0005-0008"))
    );
}

// =============================================================================
// Workflow Handoff
// =============================================================================

#[cfg(unix)]
#[tokio::test]
async fn dispatch_outcome_is_recorded_before_the_caller_exits() {
    let dir = TempDir::new().unwrap();
    let (_detector, session) = sim_session("lambda2m");
    let mut orchestrator = Orchestrator::new(&test_settings());

    let summary = orchestrator
        .acquire(&session, &fast_request(dir.path(), 2), &[])
        .await
        .unwrap();

    // The pipeline handoff runs detached from acquire; a one-shot caller
    // that drops the runtime without draining loses the ledger record.
    assert!(orchestrator.drain_dispatches(Duration::from_secs(5)).await);

    let records = orchestrator.dispatch_ledger().records();
    assert_eq!(records.len(), 1);
    assert!(records[0].succeeded);
    assert_eq!(records[0].attempts, 1);
    assert_eq!(records[0].workflow, "xpcs-transfer");
    assert_eq!(records[0].artifact, summary.artifact_path);
}

// =============================================================================
// Configuration-Driven Sessions
// =============================================================================

#[tokio::test]
async fn configured_definition_supplies_qmap_and_physical_overrides() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("xpcs.toml");
    std::fs::write(
        &config_path,
        r#"
[application]
name = "8-ID-I"

[[detectors]]
number = 25
name = "lambda2m"
type = "sim"
qmap = "/data/qmaps/lambda2m_qmap.h5"

[detectors.physical]
pixel_size_um = 55.0
bit_depth = 12
saturation = 4000
flatfield_enabled = true
efficiency = 0.87
"#,
    )
    .unwrap();

    let mut settings = Settings::load_from(&config_path).unwrap();
    settings.workflow.command = "true".to_string();
    settings.workflow.max_attempts = 1;
    settings.validate().unwrap();

    let detector: Arc<dyn AreaDetector> = Arc::new(
        SimDetector::new("lambda2m", 32, 32).with_frame_interval(Duration::ZERO),
    );
    let definition = settings.detector_by_name("lambda2m").unwrap();
    let session = DetectorSession::from_definition(definition, detector).with_geometry(32, 32);
    assert_eq!(
        session.qmap().unwrap().to_str().unwrap(),
        "/data/qmaps/lambda2m_qmap.h5"
    );

    let mut orchestrator = Orchestrator::new(&settings);
    let summary = orchestrator
        .acquire(&session, &fast_request(dir.path(), 2), &[])
        .await
        .unwrap();

    // The qmap path flows into the run metadata
    assert_eq!(
        orchestrator.registry().get_str(fields::QMAP_FILE).unwrap(),
        "/data/qmaps/lambda2m_qmap.h5"
    );
    assert!(summary.artifact_path.exists());

    // The physical override lands in the artifact's detector group
    #[cfg(not(feature = "storage_hdf5"))]
    {
        let text = std::fs::read_to_string(&summary.artifact_path).unwrap();
        let tree: serde_json::Value = serde_json::from_str(&text).unwrap();
        let detector_group = &tree["measurement"]["instrument"]["detector"];
        assert_eq!(detector_group["pixel_size_um"]["value"], 55.0);
        assert_eq!(detector_group["bit_depth"]["value"], 12);
        assert_eq!(detector_group["flatfield_enabled"]["value"], 1);
    }
}

// =============================================================================
// Artifact Content
// =============================================================================

#[cfg(not(feature = "storage_hdf5"))]
#[tokio::test]
async fn artifact_tree_records_run_identity_and_geometry() {
    let dir = TempDir::new().unwrap();
    let (_detector, session) = sim_session("lambda2m");
    let mut orchestrator = Orchestrator::new(&test_settings());

    let summary = orchestrator
        .acquire(&session, &fast_request(dir.path(), 3), &[])
        .await
        .unwrap();

    let text = std::fs::read_to_string(&summary.artifact_path).unwrap();
    let tree: serde_json::Value = serde_json::from_str(&text).unwrap();

    let acquisition = &tree["measurement"]["instrument"]["acquisition"];
    assert_eq!(acquisition["run_uid"]["value"], summary.run_uid);
    assert_eq!(acquisition["scan_id"]["value"], 1);
    assert_eq!(acquisition["num_frames"]["value"], 3);
    assert_eq!(acquisition["data_file_name"]["value"], "A001");
    assert_eq!(
        acquisition["written_file_name"]["value"],
        "A001_00001-00003.imm"
    );
    assert_eq!(acquisition["exposure_time"]["value"], 0.001);
    assert_eq!(acquisition["exposure_time"]["dtype"], "float64");

    let detector_group = &tree["measurement"]["instrument"]["detector"];
    assert_eq!(detector_group["rows"]["value"], 64);
    assert_eq!(detector_group["cols"]["value"], 48);

    let sample = &tree["measurement"]["sample"];
    assert_eq!(sample["name"]["value"], "aerogel");
    assert_eq!(sample["temperature_setpoint"]["value"], 295.0);

    // Ring current bracketing the run
    let begin = &tree["measurement"]["instrument"]["source_begin"]["current"];
    let end = &tree["measurement"]["instrument"]["source_end"]["current"];
    assert!(begin["value"].is_number());
    assert!(end["value"].is_number());
}

#[cfg(feature = "storage_hdf5")]
mod hdf5_artifact {
    use super::*;

    #[tokio::test]
    async fn artifact_is_written_as_hdf5_groups() {
        let dir = TempDir::new().unwrap();
        let (_detector, session) = sim_session("lambda2m");
        let mut orchestrator = Orchestrator::new(&test_settings());

        let summary = orchestrator
            .acquire(&session, &fast_request(dir.path(), 3), &[])
            .await
            .unwrap();

        assert_eq!(
            summary.artifact_path.extension().and_then(|e| e.to_str()),
            Some("hdf")
        );
        let file = hdf5::File::open(&summary.artifact_path).unwrap();
        let acquisition = file.group("measurement/instrument/acquisition").unwrap();
        assert!(acquisition.dataset("run_uid").is_ok());
        assert!(acquisition.dataset("num_frames").is_ok());
        assert!(file.group("measurement/sample").is_ok());
    }
}
