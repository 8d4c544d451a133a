//! Structured metadata artifact handed to the analysis pipeline.
//!
//! The artifact is a hierarchy of groups and typed scalar datasets
//! mirroring what the downstream XPCS pipeline expects:
//!
//! ```text
//! measurement/
//!   instrument/
//!     acquisition/      exposure parameters, file naming, run identity
//!     source_begin/     beam state when the exposure started
//!     source_end/       beam state when the exposure ended
//!     detector/         geometry and physical parameters
//!       roi/            only when ROI readout is enabled
//!       kinetics/       only when kinetics mode is enabled
//!       burst/          only when burst mode is enabled
//!   sample/             sample identity and position
//! ```
//!
//! Group nesting, dataset names, and dtypes are a compatibility contract:
//! counts are explicit unsigned 32/64-bit, physical quantities float64.
//! The JSON rendition is always written; an HDF5 rendition is available
//! behind the `storage_hdf5` feature. Artifacts are never overwritten --
//! callers pick a free path first (see [`free_artifact_path`]).

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{AcquireError, AppResult};
use crate::metadata::detectors::{DetectorPhysical, DetectorTable};
use crate::metadata::registry::{fields, FieldValue, MetadataRegistry};

/// One scalar dataset with an explicit dtype
#[derive(Debug, Clone, Serialize)]
pub struct Dataset {
    pub dtype: &'static str,
    pub value: serde_json::Value,
}

/// Node in the artifact tree
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Node {
    Dataset(Dataset),
    Group(BTreeMap<String, Node>),
}

impl Node {
    fn u32(value: u32) -> Self {
        Node::Dataset(Dataset {
            dtype: "uint32",
            value: value.into(),
        })
    }

    fn f64(value: f64) -> Self {
        Node::Dataset(Dataset {
            dtype: "float64",
            value: value.into(),
        })
    }

    fn flag(enabled: bool) -> Self {
        Node::u32(u32::from(enabled))
    }

    fn from_field(value: &FieldValue) -> Self {
        Node::Dataset(Dataset {
            dtype: value.dtype(),
            value: value.json_value(),
        })
    }

    /// Dataset payload, if this node is a dataset
    pub fn dataset(&self) -> Option<&Dataset> {
        match self {
            Node::Dataset(dataset) => Some(dataset),
            Node::Group(_) => None,
        }
    }
}

type Group = BTreeMap<String, Node>;

fn copy_fields(group: &mut Group, snapshot: &BTreeMap<String, FieldValue>, spec: &[(&str, &str)]) {
    for (key, field) in spec {
        if let Some(value) = snapshot.get(*field) {
            group.insert((*key).to_string(), Node::from_field(value));
        }
    }
}

fn flag_set(snapshot: &BTreeMap<String, FieldValue>, field: &str) -> bool {
    snapshot
        .get(field)
        .and_then(FieldValue::as_u32)
        .unwrap_or(0)
        != 0
}

/// In-memory artifact tree, ready to serialize
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct MetadataArtifact {
    root: Group,
}

impl MetadataArtifact {
    /// Assemble the tree from a registry snapshot and detector physics
    pub fn build(registry: &MetadataRegistry, physical: &DetectorPhysical) -> Self {
        let snapshot = registry.snapshot();

        let mut acquisition = Group::new();
        copy_fields(
            &mut acquisition,
            &snapshot,
            &[
                ("parent_folder", fields::PARENT_FOLDER),
                ("data_file_name", fields::DATA_FILE_NAME),
                ("written_file_name", fields::WRITTEN_FILE_NAME),
                ("qmap_file", fields::QMAP_FILE),
                ("scan_id", fields::SCAN_ID),
                ("run_uid", fields::RUN_UID),
                ("num_frames", fields::NUM_FRAMES),
                ("exposure_time", fields::EXPOSURE_TIME),
                ("exposure_period", fields::EXPOSURE_PERIOD),
                ("attenuation", fields::ATTENUATION),
                ("detector_number", fields::DETECTOR_NUMBER),
                ("time_begin_ns", fields::TIME_BEGIN_NS),
                ("time_end_ns", fields::TIME_END_NS),
            ],
        );

        let mut source_begin = Group::new();
        copy_fields(
            &mut source_begin,
            &snapshot,
            &[("current", fields::CURRENT_BEGIN)],
        );
        let mut source_end = Group::new();
        copy_fields(
            &mut source_end,
            &snapshot,
            &[("current", fields::CURRENT_END)],
        );

        let mut detector = Group::new();
        copy_fields(
            &mut detector,
            &snapshot,
            &[
                ("rows", fields::DETECTOR_ROWS),
                ("cols", fields::DETECTOR_COLS),
            ],
        );
        detector.insert(
            "pixel_size_um".to_string(),
            Node::f64(physical.pixel_size_um),
        );
        detector.insert("bit_depth".to_string(), Node::u32(physical.bit_depth));
        detector.insert("saturation".to_string(), Node::u32(physical.saturation));
        detector.insert(
            "flatfield_enabled".to_string(),
            Node::flag(physical.flatfield_enabled),
        );
        detector.insert(
            "blemish_enabled".to_string(),
            Node::flag(physical.blemish_enabled),
        );
        detector.insert("efficiency".to_string(), Node::f64(physical.efficiency));

        if flag_set(&snapshot, fields::ROI_ENABLED) {
            let mut roi = Group::new();
            copy_fields(
                &mut roi,
                &snapshot,
                &[
                    ("x_begin", fields::ROI_X_BEGIN),
                    ("x_end", fields::ROI_X_END),
                    ("y_begin", fields::ROI_Y_BEGIN),
                    ("y_end", fields::ROI_Y_END),
                ],
            );
            detector.insert("roi".to_string(), Node::Group(roi));
        }
        if flag_set(&snapshot, fields::KINETICS_ENABLED) {
            let mut kinetics = Group::new();
            copy_fields(
                &mut kinetics,
                &snapshot,
                &[
                    ("window_size", fields::KINETICS_WINDOW_SIZE),
                    ("top", fields::KINETICS_TOP),
                ],
            );
            detector.insert("kinetics".to_string(), Node::Group(kinetics));
        }
        if flag_set(&snapshot, fields::BURST_ENABLED) {
            let mut burst = Group::new();
            copy_fields(
                &mut burst,
                &snapshot,
                &[
                    ("count", fields::BURST_COUNT),
                    ("first_usable", fields::BURST_FIRST_USABLE),
                    ("last_usable", fields::BURST_LAST_USABLE),
                ],
            );
            detector.insert("burst".to_string(), Node::Group(burst));
        }

        let mut sample = Group::new();
        copy_fields(
            &mut sample,
            &snapshot,
            &[
                ("name", fields::SAMPLE_NAME),
                ("x", fields::SAMPLE_X),
                ("y", fields::SAMPLE_Y),
                ("z", fields::SAMPLE_Z),
                ("temperature_setpoint", fields::TEMPERATURE_SETPOINT),
                ("temperature_actual", fields::TEMPERATURE_ACTUAL),
            ],
        );

        let mut instrument = Group::new();
        instrument.insert("acquisition".to_string(), Node::Group(acquisition));
        instrument.insert("source_begin".to_string(), Node::Group(source_begin));
        instrument.insert("source_end".to_string(), Node::Group(source_end));
        instrument.insert("detector".to_string(), Node::Group(detector));

        let mut measurement = Group::new();
        measurement.insert("instrument".to_string(), Node::Group(instrument));
        measurement.insert("sample".to_string(), Node::Group(sample));

        let mut root = Group::new();
        root.insert("measurement".to_string(), Node::Group(measurement));
        Self { root }
    }

    /// Build the artifact for the registry's current detector and write the
    /// JSON rendition to `path`.
    ///
    /// # Errors
    /// `UnknownDetector` when the registry's detector number has no entry
    /// in `table`; `ArtifactIo` when `path` already exists or cannot be
    /// written.
    pub fn create(
        registry: &MetadataRegistry,
        table: &DetectorTable,
        path: &Path,
    ) -> AppResult<Self> {
        let number = registry.get_u32(fields::DETECTOR_NUMBER)?;
        let physical = table.get(number)?;
        let artifact = Self::build(registry, physical);
        artifact.write_json(path)?;
        Ok(artifact)
    }

    /// Walk a `/`-separated path through the tree
    pub fn lookup(&self, path: &str) -> Option<&Node> {
        let mut segments = path.split('/');
        let mut node = self.root.get(segments.next()?)?;
        for segment in segments {
            match node {
                Node::Group(children) => node = children.get(segment)?,
                Node::Dataset(_) => return None,
            }
        }
        Some(node)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.root)
    }

    /// Write the JSON rendition. Refuses to overwrite.
    pub fn write_json(&self, path: &Path) -> AppResult<()> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                let reason = if e.kind() == ErrorKind::AlreadyExists {
                    "already exists; refusing to overwrite".to_string()
                } else {
                    e.to_string()
                };
                AcquireError::ArtifactIo {
                    path: path.to_path_buf(),
                    reason,
                }
            })?;

        let artifact_err = |e: &dyn std::fmt::Display| AcquireError::ArtifactIo {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.root).map_err(|e| artifact_err(&e))?;
        writer.write_all(b"\n").map_err(|e| artifact_err(&e))?;
        writer.flush().map_err(|e| artifact_err(&e))?;
        Ok(())
    }

    /// Write the HDF5 rendition. Refuses to overwrite.
    #[cfg(feature = "storage_hdf5")]
    pub fn write_hdf5(&self, path: &Path) -> AppResult<()> {
        if path.exists() {
            return Err(AcquireError::ArtifactIo {
                path: path.to_path_buf(),
                reason: "already exists; refusing to overwrite".to_string(),
            });
        }
        let file = hdf5::File::create(path).map_err(|e| AcquireError::ArtifactIo {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        write_hdf5_group(&file, &self.root, path)
    }
}

#[cfg(feature = "storage_hdf5")]
fn write_hdf5_group(group: &hdf5::Group, entries: &Group, path: &Path) -> AppResult<()> {
    let artifact_err = |reason: String| AcquireError::ArtifactIo {
        path: path.to_path_buf(),
        reason,
    };
    for (name, node) in entries {
        match node {
            Node::Group(children) => {
                let sub = group
                    .create_group(name)
                    .map_err(|e| artifact_err(e.to_string()))?;
                write_hdf5_group(&sub, children, path)?;
            }
            Node::Dataset(dataset) => {
                write_hdf5_dataset(group, name, dataset).map_err(artifact_err)?;
            }
        }
    }
    Ok(())
}

#[cfg(feature = "storage_hdf5")]
fn write_hdf5_dataset(group: &hdf5::Group, name: &str, dataset: &Dataset) -> Result<(), String> {
    let h5 = |e: hdf5::Error| e.to_string();
    match dataset.dtype {
        "uint32" => {
            let value = dataset.value.as_u64().unwrap_or(0) as u32;
            group
                .new_dataset::<u32>()
                .create(name, ())
                .map_err(h5)?
                .write_scalar(&value)
                .map_err(h5)?;
        }
        "uint64" => {
            let value = dataset.value.as_u64().unwrap_or(0);
            group
                .new_dataset::<u64>()
                .create(name, ())
                .map_err(h5)?
                .write_scalar(&value)
                .map_err(h5)?;
        }
        "float64" => {
            let value = dataset.value.as_f64().unwrap_or(0.0);
            group
                .new_dataset::<f64>()
                .create(name, ())
                .map_err(h5)?
                .write_scalar(&value)
                .map_err(h5)?;
        }
        "string" => {
            let text = dataset.value.as_str().unwrap_or("");
            let value: hdf5::types::VarLenUnicode =
                text.parse().map_err(|e| format!("{e:?}"))?;
            group
                .new_dataset::<hdf5::types::VarLenUnicode>()
                .create(name, ())
                .map_err(h5)?
                .write_scalar(&value)
                .map_err(h5)?;
        }
        other => return Err(format!("unsupported dtype '{other}'")),
    }
    Ok(())
}

/// Deterministic collision-avoided path: `<stem>.<ext>`, then
/// `<stem>_1.<ext>`, `<stem>_2.<ext>`, incrementing until free.
pub fn free_artifact_path(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    let candidate = dir.join(format!("{stem}.{extension}"));
    if !candidate.exists() {
        return candidate;
    }
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{stem}_{n}.{extension}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}
