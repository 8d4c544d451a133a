//! Typed named-field registry captured around each acquisition.
//!
//! Every value that ends up in the metadata artifact passes through here:
//! the orchestrator writes transient state (beam current, sample position,
//! timestamps) into named slots before and after the exposure, and the
//! artifact builder reads a snapshot afterwards. Fields are typed at the
//! slot level; reading a slot as the wrong type is a wiring error and
//! fails loudly rather than coercing.
//!
//! Writes are immediately visible to reads (write-then-read returns the
//! written value), which is the round-trip contract the artifact builder
//! depends on.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{AcquireError, AppResult};

/// Canonical field names used by the orchestrator and artifact builder.
///
/// Names are a compatibility contract with the downstream pipeline; add
/// new ones rather than renaming.
pub mod fields {
    pub const DETECTOR_NUMBER: &str = "detector_number";
    pub const DETECTOR_ROWS: &str = "detector_rows";
    pub const DETECTOR_COLS: &str = "detector_cols";

    pub const PARENT_FOLDER: &str = "parent_folder";
    pub const DATA_FILE_NAME: &str = "data_file_name";
    pub const WRITTEN_FILE_NAME: &str = "written_file_name";
    pub const QMAP_FILE: &str = "qmap_file";

    pub const SCAN_ID: &str = "scan_id";
    pub const RUN_UID: &str = "run_uid";
    pub const NUM_FRAMES: &str = "num_frames";
    pub const EXPOSURE_TIME: &str = "exposure_time";
    pub const EXPOSURE_PERIOD: &str = "exposure_period";
    pub const ATTENUATION: &str = "attenuation";

    pub const SAMPLE_NAME: &str = "sample_name";
    pub const SAMPLE_X: &str = "sample_x";
    pub const SAMPLE_Y: &str = "sample_y";
    pub const SAMPLE_Z: &str = "sample_z";
    pub const TEMPERATURE_SETPOINT: &str = "temperature_setpoint";
    pub const TEMPERATURE_ACTUAL: &str = "temperature_actual";

    pub const CURRENT_BEGIN: &str = "source_begin_current";
    pub const CURRENT_END: &str = "source_end_current";
    pub const TIME_BEGIN_NS: &str = "time_begin_ns";
    pub const TIME_END_NS: &str = "time_end_ns";

    pub const ROI_ENABLED: &str = "roi_enabled";
    pub const ROI_X_BEGIN: &str = "roi_x_begin";
    pub const ROI_X_END: &str = "roi_x_end";
    pub const ROI_Y_BEGIN: &str = "roi_y_begin";
    pub const ROI_Y_END: &str = "roi_y_end";

    pub const KINETICS_ENABLED: &str = "kinetics_enabled";
    pub const KINETICS_WINDOW_SIZE: &str = "kinetics_window_size";
    pub const KINETICS_TOP: &str = "kinetics_top";

    pub const BURST_ENABLED: &str = "burst_enabled";
    pub const BURST_COUNT: &str = "burst_count";
    pub const BURST_FIRST_USABLE: &str = "burst_first_usable";
    pub const BURST_LAST_USABLE: &str = "burst_last_usable";
}

/// One typed registry slot
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    U32(u32),
    U64(u64),
    F64(f64),
    Str(String),
}

impl FieldValue {
    /// Explicit dtype name carried into the artifact
    pub fn dtype(&self) -> &'static str {
        match self {
            FieldValue::U32(_) => "uint32",
            FieldValue::U64(_) => "uint64",
            FieldValue::F64(_) => "float64",
            FieldValue::Str(_) => "string",
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            FieldValue::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(v) => Some(v),
            _ => None,
        }
    }

    /// Plain JSON rendition of the value, without the dtype wrapper
    pub fn json_value(&self) -> serde_json::Value {
        match self {
            FieldValue::U32(v) => serde_json::Value::from(*v),
            FieldValue::U64(v) => serde_json::Value::from(*v),
            FieldValue::F64(v) => serde_json::Value::from(*v),
            FieldValue::Str(v) => serde_json::Value::from(v.clone()),
        }
    }
}

/// Process-wide registry of typed metadata fields
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    fields: RwLock<BTreeMap<String, FieldValue>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or overwrite a field
    pub fn set(&self, name: &str, value: FieldValue) {
        self.fields.write().insert(name.to_string(), value);
    }

    pub fn set_u32(&self, name: &str, value: u32) {
        self.set(name, FieldValue::U32(value));
    }

    pub fn set_u64(&self, name: &str, value: u64) {
        self.set(name, FieldValue::U64(value));
    }

    pub fn set_f64(&self, name: &str, value: f64) {
        self.set(name, FieldValue::F64(value));
    }

    pub fn set_str(&self, name: &str, value: impl Into<String>) {
        self.set(name, FieldValue::Str(value.into()));
    }

    pub fn get(&self, name: &str) -> Option<FieldValue> {
        self.fields.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.read().contains_key(name)
    }

    fn typed<T>(
        &self,
        name: &str,
        expected: &'static str,
        extract: impl Fn(&FieldValue) -> Option<T>,
    ) -> AppResult<T> {
        let fields = self.fields.read();
        let value = fields.get(name).ok_or_else(|| {
            AcquireError::InvalidArgument(format!("metadata field '{name}' is not set"))
        })?;
        extract(value).ok_or_else(|| {
            AcquireError::InvalidArgument(format!(
                "metadata field '{name}' holds {}, not {expected}",
                value.dtype()
            ))
        })
    }

    pub fn get_u32(&self, name: &str) -> AppResult<u32> {
        self.typed(name, "uint32", FieldValue::as_u32)
    }

    pub fn get_u64(&self, name: &str) -> AppResult<u64> {
        self.typed(name, "uint64", FieldValue::as_u64)
    }

    pub fn get_f64(&self, name: &str) -> AppResult<f64> {
        self.typed(name, "float64", FieldValue::as_f64)
    }

    pub fn get_str(&self, name: &str) -> AppResult<String> {
        self.typed(name, "string", |v| v.as_str().map(str::to_string))
    }

    /// Consistent point-in-time copy of every field
    pub fn snapshot(&self) -> BTreeMap<String, FieldValue> {
        self.fields.read().clone()
    }

    pub fn len(&self) -> usize {
        self.fields.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.read().is_empty()
    }
}
