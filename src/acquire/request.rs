//! Acquisition request value object.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::StagingSetup;
use crate::error::{AcquireError, AppResult};

/// Everything the caller decides about one acquisition.
///
/// Constructed fresh per acquisition and never mutated after submission;
/// the orchestrator derives device staging parameters and metadata fields
/// from it but writes nothing back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionRequest {
    /// Directory the detector writes its container into
    pub data_path: PathBuf,
    /// Base file name without directory components or extension
    pub file_name: String,
    /// Exposure time per frame, seconds
    pub acquire_time: f64,
    /// Frame-to-frame period, seconds
    pub acquire_period: f64,
    /// Number of exposures to capture
    pub num_images: u32,
    /// Attenuator setting in effect for this acquisition
    #[serde(default)]
    pub attenuation: u32,
    /// Submit the run for XPCS analysis after transfer
    #[serde(default)]
    pub submit_for_analysis: bool,
    /// Sample name recorded in the run metadata
    #[serde(default)]
    pub sample_name: String,
    /// Free-form caller metadata folded into the run start document
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AcquisitionRequest {
    pub fn new(
        data_path: impl Into<PathBuf>,
        file_name: impl Into<String>,
        acquire_time: f64,
        acquire_period: f64,
        num_images: u32,
    ) -> Self {
        Self {
            data_path: data_path.into(),
            file_name: file_name.into(),
            acquire_time,
            acquire_period,
            num_images,
            attenuation: 0,
            submit_for_analysis: false,
            sample_name: String::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_attenuation(mut self, attenuation: u32) -> Self {
        self.attenuation = attenuation;
        self
    }

    /// Request XPCS analysis after the transfer leg completes
    pub fn for_analysis(mut self) -> Self {
        self.submit_for_analysis = true;
        self
    }

    pub fn with_sample_name(mut self, name: impl Into<String>) -> Self {
        self.sample_name = name.into();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Check the request before any hardware is touched.
    ///
    /// # Errors
    /// `Configuration` with the offending value embedded; callers can
    /// correct the request and resubmit.
    pub fn validate(&self) -> AppResult<()> {
        if self.data_path.as_os_str().is_empty() {
            return Err(AcquireError::Configuration(
                "acquisition request has an empty target path".to_string(),
            ));
        }
        if self.file_name.is_empty() {
            return Err(AcquireError::Configuration(
                "acquisition request has an empty base file name".to_string(),
            ));
        }
        if self.num_images == 0 {
            return Err(AcquireError::Configuration(
                "acquisition request asks for zero images".to_string(),
            ));
        }
        if !self.acquire_time.is_finite() || self.acquire_time <= 0.0 {
            return Err(AcquireError::Configuration(format!(
                "acquire time must be positive, got {}",
                self.acquire_time
            )));
        }
        if !self.acquire_period.is_finite() || self.acquire_period <= 0.0 {
            return Err(AcquireError::Configuration(format!(
                "acquire period must be positive, got {}",
                self.acquire_period
            )));
        }
        if self.acquire_period < self.acquire_time {
            return Err(AcquireError::Configuration(format!(
                "acquire period {} is shorter than acquire time {}",
                self.acquire_period, self.acquire_time
            )));
        }
        Ok(())
    }

    /// Staging parameters handed to the detector
    pub fn staging_setup(&self) -> StagingSetup {
        StagingSetup {
            file_path: self.data_path.clone(),
            file_name: self.file_name.clone(),
            num_images: self.num_images,
            acquire_time: self.acquire_time,
            acquire_period: self.acquire_period,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn request() -> AcquisitionRequest {
        AcquisitionRequest::new("/data/run1", "A001", 0.1, 0.11, 50)
    }

    #[test]
    fn valid_request_passes() {
        request().validate().unwrap();
    }

    #[test]
    fn empty_path_is_a_configuration_error() {
        let mut r = request();
        r.data_path = PathBuf::new();
        let err = r.validate().unwrap_err();
        assert!(matches!(err, AcquireError::Configuration(_)));
        assert!(err.is_pre_hardware());
    }

    #[test]
    fn degenerate_timing_is_rejected() {
        let mut r = request();
        r.num_images = 0;
        assert!(r.validate().is_err());

        let mut r = request();
        r.acquire_time = 0.0;
        assert!(r.validate().is_err());

        let mut r = request();
        r.acquire_period = 0.05; // shorter than the 0.1 s exposure
        let msg = r.validate().unwrap_err().to_string();
        assert!(msg.contains("0.05"));
        assert!(msg.contains("0.1"));
    }

    #[test]
    fn staging_setup_carries_the_request_fields() {
        let setup = request().staging_setup();
        assert_eq!(setup.file_path, Path::new("/data/run1"));
        assert_eq!(setup.file_name, "A001");
        assert_eq!(setup.num_images, 50);
        assert!((setup.acquire_time - 0.1).abs() < f64::EPSILON);
        setup.validate().unwrap();
    }

    #[test]
    fn builders_compose() {
        let r = request()
            .with_attenuation(3)
            .for_analysis()
            .with_sample_name("latex_sphere")
            .with_metadata("proposal", "GUP-12345");
        assert_eq!(r.attenuation, 3);
        assert!(r.submit_for_analysis);
        assert_eq!(r.sample_name, "latex_sphere");
        assert_eq!(r.metadata["proposal"], "GUP-12345");
    }
}
