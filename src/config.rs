//! Beamline configuration using Figment
//!
//! This module provides strongly-typed configuration loading for the
//! acquisition core. Configuration is loaded from:
//! 1. config/xpcs.toml file (base configuration)
//! 2. Environment variables (prefixed with XPCS_DAQ_)
//!
//! # Example
//! ```no_run
//! use xpcs_daq::config::Settings;
//!
//! # fn main() -> Result<(), figment::Error> {
//! let settings = Settings::load()?;
//! println!("Application: {}", settings.application.name);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::metadata::detectors::DetectorPhysical;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Acquisition sequencing settings
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Settle-wait settings
    #[serde(default)]
    pub settle: SettleConfig,
    /// External workflow pipeline settings
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Detector session definitions
    #[serde(default)]
    pub detectors: Vec<DetectorDefinition>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            acquisition: AcquisitionConfig::default(),
            settle: SettleConfig::default(),
            workflow: WorkflowConfig::default(),
            detectors: Vec::new(),
        }
    }
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
        }
    }
}

/// Acquisition sequencing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Upper bound on the trigger completion wait for one acquisition.
    /// Sized per beamtime; long multi-frame counts need a generous cap.
    #[serde(with = "humantime_serde", default = "default_acquire_timeout")]
    pub acquire_timeout: Duration,
    /// First sequential scan number handed out by a fresh process
    #[serde(default = "default_scan_id_start")]
    pub scan_id_start: u64,
    /// Delay between enabling external pulse generation and the first pulse
    /// edge being trusted. Empirically determined per trigger electronics,
    /// not a protocol acknowledgement.
    #[serde(with = "humantime_serde", default = "default_pulse_arm_delay")]
    pub pulse_arm_delay: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: default_acquire_timeout(),
            scan_id_start: default_scan_id_start(),
            pulse_arm_delay: default_pulse_arm_delay(),
        }
    }
}

/// Settle-wait configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleConfig {
    /// Fallback poll interval for settle checks
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Interval between progress reports while waiting
    #[serde(with = "humantime_serde", default = "default_report_interval")]
    pub report_interval: Duration,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            report_interval: default_report_interval(),
        }
    }
}

/// External workflow pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Executable invoked to start a workflow
    #[serde(default = "default_workflow_command")]
    pub command: String,
    /// Workflow name for transfer-only dispatch
    #[serde(default = "default_transfer_workflow")]
    pub transfer_workflow: String,
    /// Workflow name for transfer-plus-analysis dispatch
    #[serde(default = "default_analysis_workflow")]
    pub analysis_workflow: String,
    /// Group name handed to the analysis side (`xpcsGroupName` argument)
    #[serde(default = "default_group_name")]
    pub group_name: String,
    /// Maximum dispatch attempts per artifact
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between dispatch attempts
    #[serde(with = "humantime_serde", default = "default_retry_backoff")]
    pub retry_backoff: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            command: default_workflow_command(),
            transfer_workflow: default_transfer_workflow(),
            analysis_workflow: default_analysis_workflow(),
            group_name: default_group_name(),
            max_attempts: default_max_attempts(),
            retry_backoff: default_retry_backoff(),
        }
    }
}

/// Detector session definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorDefinition {
    /// Stable detector number, the key into the physical-parameter table
    pub number: u32,
    /// Symbolic detector name
    pub name: String,
    /// Electronics family ("plugin", "vendor", "burst", "sim")
    pub r#type: String,
    /// Whether this detector is selectable
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Partition-map file used by downstream analysis
    #[serde(default)]
    pub qmap: Option<PathBuf>,
    /// Detector-specific configuration (dynamic)
    #[serde(default)]
    pub config: Option<toml::Value>,
    /// Overrides for the built-in physical-parameter table
    #[serde(default)]
    pub physical: Option<DetectorPhysical>,
}

// Default value functions
fn default_app_name() -> String {
    "xpcs_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_scan_id_start() -> u64 {
    1
}

fn default_pulse_arm_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_report_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_workflow_command() -> String {
    "dm-start-processing-job".to_string()
}

fn default_transfer_workflow() -> String {
    "xpcs-transfer".to_string()
}

fn default_analysis_workflow() -> String {
    "xpcs-analysis".to_string()
}

fn default_group_name() -> String {
    "xpcs".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_enabled() -> bool {
    true
}

const VALID_DETECTOR_TYPES: [&str; 4] = ["plugin", "vendor", "burst", "sim"];

impl Settings {
    /// Load configuration from config/xpcs.toml and environment variables
    ///
    /// Environment variables can override configuration with prefix XPCS_DAQ_
    /// Example: XPCS_DAQ_APPLICATION_LOG_LEVEL=debug
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/xpcs.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("XPCS_DAQ_").split("_"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.workflow.max_attempts == 0 {
            return Err("workflow.max_attempts must be at least 1".to_string());
        }

        if self.settle.poll_interval.is_zero() {
            return Err("settle.poll_interval must be non-zero".to_string());
        }

        // Validate detector types and unique numbers/names
        let mut numbers = std::collections::HashSet::new();
        let mut names = std::collections::HashSet::new();
        for det in &self.detectors {
            if !VALID_DETECTOR_TYPES.contains(&det.r#type.as_str()) {
                return Err(format!(
                    "Invalid detector type '{}' for '{}'. Must be one of: {}",
                    det.r#type,
                    det.name,
                    VALID_DETECTOR_TYPES.join(", ")
                ));
            }
            if !numbers.insert(det.number) {
                return Err(format!("Duplicate detector number: {}", det.number));
            }
            if !names.insert(&det.name) {
                return Err(format!("Duplicate detector name: {}", det.name));
            }
        }

        Ok(())
    }

    /// Get all enabled detector definitions
    pub fn enabled_detectors(&self) -> Vec<&DetectorDefinition> {
        self.detectors.iter().filter(|det| det.enabled).collect()
    }

    /// Look up a detector definition by symbolic name
    pub fn detector_by_name(&self, name: &str) -> Option<&DetectorDefinition> {
        self.detectors.iter().find(|det| det.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> Settings {
        Settings {
            application: ApplicationConfig {
                name: "Test".to_string(),
                log_level: "info".to_string(),
            },
            acquisition: AcquisitionConfig::default(),
            settle: SettleConfig::default(),
            workflow: WorkflowConfig::default(),
            detectors: vec![DetectorDefinition {
                number: 25,
                name: "lambda2m".to_string(),
                r#type: "plugin".to_string(),
                enabled: true,
                qmap: Some(PathBuf::from("/data/qmaps/lambda2m_qmap.h5")),
                config: None,
                physical: None,
            }],
        }
    }

    #[test]
    fn test_config_validation() {
        let settings = test_settings();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = test_settings();
        settings.application.log_level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_invalid_detector_type() {
        let mut settings = test_settings();
        settings.detectors[0].r#type = "ccd".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_duplicate_detector_numbers() {
        let mut settings = test_settings();
        let mut dup = settings.detectors[0].clone();
        dup.name = "lambda2m_b".to_string();
        settings.detectors.push(dup);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xpcs.toml");
        std::fs::write(
            &path,
            r#"
[application]
name = "8-ID-I"

[acquisition]
pulse_arm_delay = "250ms"

[[detectors]]
number = 25
name = "lambda2m"
type = "plugin"
"#,
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.application.name, "8-ID-I");
        assert_eq!(settings.application.log_level, "info");
        assert_eq!(
            settings.acquisition.acquire_timeout,
            Duration::from_secs(600)
        );
        assert_eq!(
            settings.acquisition.pulse_arm_delay,
            Duration::from_millis(250)
        );
        assert_eq!(settings.detectors.len(), 1);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_enabled_detectors_filter() {
        let mut settings = test_settings();
        let mut off = settings.detectors[0].clone();
        off.number = 26;
        off.name = "rigaku500k".to_string();
        off.enabled = false;
        settings.detectors.push(off);

        let enabled = settings.enabled_detectors();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "lambda2m");
    }
}
