//! Detector sessions.
//!
//! A [`DetectorSession`] is one configured detector as the beamline profile
//! sees it: a stable number, a symbolic name, an acquisition-mode
//! descriptor, a q-map reference for downstream analysis, and the device
//! that does the work. Sessions are created at profile load and live for
//! the whole process; the only mutation they support is switching the
//! q-map between acquisitions.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::DetectorDefinition;
use crate::device::AreaDetector;

/// How exposures are initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// The detector times its own exposures
    Internal,
    /// Exposures follow externally generated pulses
    External,
}

/// How many images one acquisition produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageMode {
    Single,
    Multiple,
}

/// Acquisition-mode descriptor for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionMode {
    pub trigger_source: TriggerSource,
    pub image_mode: ImageMode,
}

impl AcquisitionMode {
    pub fn internal() -> Self {
        Self {
            trigger_source: TriggerSource::Internal,
            image_mode: ImageMode::Multiple,
        }
    }

    pub fn external() -> Self {
        Self {
            trigger_source: TriggerSource::External,
            image_mode: ImageMode::Multiple,
        }
    }

    /// Compact label for log fields, e.g. `"external/multiple"`
    pub fn label(&self) -> String {
        let trigger = match self.trigger_source {
            TriggerSource::Internal => "internal",
            TriggerSource::External => "external",
        };
        let images = match self.image_mode {
            ImageMode::Single => "single",
            ImageMode::Multiple => "multiple",
        };
        format!("{trigger}/{images}")
    }
}

impl Default for AcquisitionMode {
    fn default() -> Self {
        Self::internal()
    }
}

/// Hardware region-of-interest bounds, pixels, inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoiBounds {
    pub x_begin: u32,
    pub x_end: u32,
    pub y_begin: u32,
    pub y_end: u32,
}

/// Kinetics-mode window placement on the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KineticsWindow {
    pub window_size: u32,
    pub top: u32,
}

/// Burst-mode frame bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BurstWindow {
    pub count: u32,
    pub first_usable: u32,
    pub last_usable: u32,
}

/// One configured detector, alive for the process lifetime
pub struct DetectorSession {
    number: u32,
    name: String,
    mode: AcquisitionMode,
    geometry: (u32, u32),
    roi: Option<RoiBounds>,
    kinetics: Option<KineticsWindow>,
    burst: Option<BurstWindow>,
    qmap: parking_lot::RwLock<Option<PathBuf>>,
    detector: Arc<dyn AreaDetector>,
}

impl DetectorSession {
    pub fn new(
        number: u32,
        name: impl Into<String>,
        mode: AcquisitionMode,
        detector: Arc<dyn AreaDetector>,
    ) -> Self {
        Self {
            number,
            name: name.into(),
            mode,
            geometry: (1024, 1024),
            roi: None,
            kinetics: None,
            burst: None,
            qmap: parking_lot::RwLock::new(None),
            detector,
        }
    }

    /// Build a session from a configuration entry.
    ///
    /// The mode descriptor follows the device: detectors that need external
    /// pulses are externally triggered.
    pub fn from_definition(definition: &DetectorDefinition, detector: Arc<dyn AreaDetector>) -> Self {
        let mode = if detector.needs_external_pulses() {
            AcquisitionMode::external()
        } else {
            AcquisitionMode::internal()
        };
        let session = Self::new(definition.number, definition.name.clone(), mode, detector);
        if let Some(qmap) = &definition.qmap {
            session.set_qmap(qmap.clone());
        }
        session
    }

    /// Sensor geometry as (rows, cols)
    pub fn with_geometry(mut self, rows: u32, cols: u32) -> Self {
        self.geometry = (rows, cols);
        self
    }

    pub fn with_roi(mut self, roi: RoiBounds) -> Self {
        self.roi = Some(roi);
        self
    }

    pub fn with_kinetics(mut self, kinetics: KineticsWindow) -> Self {
        self.kinetics = Some(kinetics);
        self
    }

    pub fn with_burst(mut self, burst: BurstWindow) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> AcquisitionMode {
        self.mode
    }

    pub fn geometry(&self) -> (u32, u32) {
        self.geometry
    }

    pub fn roi(&self) -> Option<RoiBounds> {
        self.roi
    }

    pub fn kinetics(&self) -> Option<KineticsWindow> {
        self.kinetics
    }

    pub fn burst(&self) -> Option<BurstWindow> {
        self.burst
    }

    /// Current q-map reference, if one is registered
    pub fn qmap(&self) -> Option<PathBuf> {
        self.qmap.read().clone()
    }

    /// Switch the q-map between acquisitions
    pub fn set_qmap(&self, path: PathBuf) {
        *self.qmap.write() = Some(path);
    }

    pub fn clear_qmap(&self) {
        *self.qmap.write() = None;
    }

    /// The device this session drives
    pub fn detector(&self) -> Arc<dyn AreaDetector> {
        Arc::clone(&self.detector)
    }
}

impl std::fmt::Debug for DetectorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectorSession")
            .field("number", &self.number)
            .field("name", &self.name)
            .field("mode", &self.mode.label())
            .field("qmap", &*self.qmap.read())
            .finish_non_exhaustive()
    }
}
