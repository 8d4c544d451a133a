//! Asset document model for externally written detector data.
//!
//! Detectors in this system never stream pixel data through the process:
//! the hardware (or its file-writer plugin) writes IMM containers directly
//! to disk, and the acquisition layer records *references* to that data as
//! Bluesky-style documents:
//!
//! - **ResourceDoc**: one physical container file, allocated at stage time
//! - **DatumDoc**: one captured exposure inside a resource
//! - **RunStartDoc** / **RunStopDoc**: bracket a single acquisition run
//!
//! # Document Flow
//!
//! ```text
//! RunStartDoc (1)
//!    │
//!    ├── ResourceDoc (1 per detector, created at stage)
//!    │       │
//!    │       └── DatumDoc (N, one per captured exposure)
//!    │
//! RunStopDoc (1)
//! ```
//!
//! Devices accumulate their resource and datums in an [`AssetCache`] while
//! an acquisition is in flight; the orchestrator drains every cache during
//! unstage and folds the bundles into the run ledger.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Document types emitted over the lifetime of one acquisition run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    /// Run start - intent and identity of the acquisition
    RunStart(RunStartDoc),
    /// Physical container file written by a detector
    Resource(ResourceDoc),
    /// One captured exposure within a resource
    Datum(DatumDoc),
    /// Run stop - completion status and datum count
    RunStop(RunStopDoc),
}

impl Document {
    /// Get the document UID
    pub fn uid(&self) -> &str {
        match self {
            Document::RunStart(d) => &d.uid,
            Document::Resource(d) => &d.uid,
            Document::Datum(d) => &d.uid,
            Document::RunStop(d) => &d.uid,
        }
    }

    /// Get the run UID this document belongs to
    pub fn run_uid(&self) -> &str {
        match self {
            Document::RunStart(d) => &d.uid, // start doc UID is the run UID
            Document::Resource(d) => &d.run_uid,
            Document::Datum(d) => &d.run_uid,
            Document::RunStop(d) => &d.run_uid,
        }
    }

    /// Get the timestamp in nanoseconds
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            Document::RunStart(d) => d.time_ns,
            Document::Resource(d) => d.time_ns,
            Document::Datum(d) => d.time_ns,
            Document::RunStop(d) => d.time_ns,
        }
    }
}

/// Run start document - emitted when an acquisition run begins
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartDoc {
    /// Unique run identifier (this IS the run_uid)
    pub uid: String,
    /// Monotonically increasing scan number
    pub scan_id: u64,
    /// Plan name that produced this run
    pub plan_name: String,
    /// Sample name supplied by the caller
    pub sample_name: String,
    /// Detector names participating in the run
    pub detectors: Vec<String>,
    /// Caller-provided metadata
    pub metadata: HashMap<String, String>,
    /// Timestamp when the run started
    pub time_ns: u64,
}

impl RunStartDoc {
    pub fn new(scan_id: u64, plan_name: &str, sample_name: &str) -> Self {
        Self {
            uid: new_uid(),
            scan_id,
            plan_name: plan_name.to_string(),
            sample_name: sample_name.to_string(),
            detectors: Vec::new(),
            metadata: HashMap::new(),
            time_ns: now_ns(),
        }
    }

    pub fn with_detector(mut self, name: &str) -> Self {
        self.detectors.push(name.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Resource document - identifies one physical container file
///
/// Created when a detector stages, before any frame exists on disk. Every
/// datum produced during the acquisition references exactly one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDoc {
    /// Unique resource ID
    pub uid: String,
    /// Links to RunStartDoc
    pub run_uid: String,
    /// Detector that owns the file
    pub detector: String,
    /// Container format name (e.g., "IMM")
    pub spec: String,
    /// Directory the container lives in
    pub root: PathBuf,
    /// File name within `root`
    pub resource_path: String,
    /// Frames grouped into one logical point when reading back
    pub frames_per_point: u32,
    /// Timestamp when the resource was allocated
    pub time_ns: u64,
}

impl ResourceDoc {
    /// Allocate a resource for `detector`. The run UID is stamped later by
    /// [`AssetBundle::stamp_run`] when the orchestrator collects the bundle.
    pub fn new(detector: &str, root: &Path, resource_path: &str) -> Self {
        Self {
            uid: new_uid(),
            run_uid: String::new(),
            detector: detector.to_string(),
            spec: "IMM".to_string(),
            root: root.to_path_buf(),
            resource_path: resource_path.to_string(),
            frames_per_point: 1,
            time_ns: now_ns(),
        }
    }

    pub fn with_frames_per_point(mut self, frames_per_point: u32) -> Self {
        self.frames_per_point = frames_per_point;
        self
    }

    /// Full on-disk path of the container file
    pub fn full_path(&self) -> PathBuf {
        self.root.join(&self.resource_path)
    }
}

/// Datum document - one captured exposure within a resource
///
/// The UID follows the `"<resource_uid>/<index>"` convention so a datum can
/// be resolved back to its resource without a lookup table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatumDoc {
    /// Unique datum ID (`"<resource_uid>/<index>"`)
    pub uid: String,
    /// Links to RunStartDoc
    pub run_uid: String,
    /// Links to the owning ResourceDoc
    pub resource_uid: String,
    /// Logical point index within the container
    pub point_index: u32,
    /// Timestamp when the exposure completed
    pub time_ns: u64,
}

impl DatumDoc {
    /// Record one exposure against a resource. The run UID is stamped later
    /// by [`AssetBundle::stamp_run`].
    pub fn new(resource_uid: &str, point_index: u32) -> Self {
        Self {
            uid: format!("{resource_uid}/{point_index}"),
            run_uid: String::new(),
            resource_uid: resource_uid.to_string(),
            point_index,
            time_ns: now_ns(),
        }
    }
}

/// Run stop document - emitted when an acquisition run ends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStopDoc {
    /// Unique stop doc ID
    pub uid: String,
    /// Links to RunStartDoc
    pub run_uid: String,
    /// Exit status: "success" or "fail"
    pub exit_status: String,
    /// Reason for failure (empty on success)
    pub reason: String,
    /// Total datums recorded across all detectors
    pub num_datums: u32,
    /// Timestamp when the run ended
    pub time_ns: u64,
}

impl RunStopDoc {
    pub fn success(run_uid: &str, num_datums: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status: "success".to_string(),
            reason: String::new(),
            num_datums,
            time_ns: now_ns(),
        }
    }

    pub fn fail(run_uid: &str, reason: &str, num_datums: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status: "fail".to_string(),
            reason: reason.to_string(),
            num_datums,
            time_ns: now_ns(),
        }
    }
}

/// Resource plus the datums recorded against it, drained from a device
#[derive(Debug, Clone, Default)]
pub struct AssetBundle {
    /// Container allocated at stage time, if the device staged one
    pub resource: Option<ResourceDoc>,
    /// One entry per captured exposure
    pub datums: Vec<DatumDoc>,
}

impl AssetBundle {
    /// Number of datums in the bundle
    pub fn datum_count(&self) -> u32 {
        self.datums.len() as u32
    }

    /// Stamp every document in the bundle with its owning run.
    ///
    /// Devices allocate resources and datums before the run identity
    /// reaches them, so collection is where the link is made.
    pub fn stamp_run(&mut self, run_uid: &str) {
        if let Some(resource) = self.resource.as_mut() {
            resource.run_uid = run_uid.to_string();
        }
        for datum in &mut self.datums {
            datum.run_uid = run_uid.to_string();
        }
    }
}

/// Per-device accumulator for asset documents.
///
/// Cloning shares the underlying cache, so a device can hand a clone to its
/// completion task and still drain the same documents at unstage time.
#[derive(Debug, Clone, Default)]
pub struct AssetCache {
    inner: Arc<parking_lot::Mutex<AssetBundle>>,
}

impl AssetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the resource for the acquisition that is being staged.
    ///
    /// Replaces any bundle left over from a previous run.
    pub fn stage_resource(&self, resource: ResourceDoc) {
        let mut inner = self.inner.lock();
        inner.resource = Some(resource);
        inner.datums.clear();
    }

    /// Record one datum per point index in `0..count` against the staged
    /// resource. Does nothing if no resource is staged.
    pub fn record_datums(&self, count: u32) {
        let mut inner = self.inner.lock();
        let Some(resource_uid) = inner.resource.as_ref().map(|r| r.uid.clone()) else {
            return;
        };
        for index in 0..count {
            inner.datums.push(DatumDoc::new(&resource_uid, index));
        }
    }

    /// Rewrite the staged resource's file name.
    ///
    /// Burst-mode hardware names its own output files and only reports the
    /// name after the exposure completes.
    pub fn update_resource_file(&self, resource_path: &str) {
        let mut inner = self.inner.lock();
        if let Some(resource) = inner.resource.as_mut() {
            resource.resource_path = resource_path.to_string();
        }
    }

    /// Rewrite the staged resource's frames-per-point, for hardware that
    /// decides its own frame count.
    pub fn update_resource_frames(&self, frames_per_point: u32) {
        let mut inner = self.inner.lock();
        if let Some(resource) = inner.resource.as_mut() {
            resource.frames_per_point = frames_per_point.max(1);
        }
    }

    /// Staged resource, if any
    pub fn resource(&self) -> Option<ResourceDoc> {
        self.inner.lock().resource.clone()
    }

    /// Number of datums recorded so far
    pub fn datum_count(&self) -> u32 {
        self.inner.lock().datums.len() as u32
    }

    /// Take the accumulated bundle, leaving the cache empty
    pub fn drain(&self) -> AssetBundle {
        std::mem::take(&mut *self.inner.lock())
    }
}
