//! Custom error types for the acquisition core.
//!
//! This module defines the primary error type, `AcquireError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure modes of an acquisition, from request
//! validation and container parsing to device communication and metadata
//! artifact construction.
//!
//! ## Error Hierarchy
//!
//! `AcquireError` is an enum that consolidates the crate's error sources:
//!
//! - **`Config`**: Wraps errors from the `figment` crate, typically related to
//!   file parsing or format issues in the configuration files.
//! - **`Configuration`**: Semantic errors in an acquisition request or settings
//!   that parse fine but are logically invalid (e.g., an empty target path).
//!   Raised before any hardware is touched.
//! - **`InvalidArgument`**: A device's staging contract was called with invalid
//!   contents. Indicates a programming error in device wiring, not a runtime
//!   condition, so it is raised loudly rather than logged and skipped.
//! - **`Format`**: The binary frame container could not be parsed. The
//!   container is considered corrupt; no partial read past the failure point
//!   is attempted.
//! - **`SettleTimeout`**: A monitored readback failed to reach its target
//!   within the allotted time. Carries the last-seen readback, the target, and
//!   the elapsed time so the message embeds the offending values.
//! - **`UnknownDetector` / `ArtifactIo`**: Metadata artifact construction
//!   failed. Fatal to that acquisition's metadata step, but already-captured
//!   frame data stays valid.
//! - **`Device`**: Communication with a detector or auxiliary device failed.
//!   Propagates only after the unconditional unstage step has run.
//!
//! By using `#[from]`, `AcquireError` can be seamlessly created from
//! underlying error types, simplifying error handling throughout the crate
//! with the `?` operator.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, AcquireError>;

/// Primary error type for the acquisition core.
///
/// # Error Categories
///
/// 1. **Pre-hardware errors** - `Config`, `Configuration`, `InvalidArgument`
///    - Raised synchronously before any device has been staged
///    - Recovery: correct the request or configuration and retry
///
/// 2. **Acquisition errors** - `Device`, `AlreadyStaged`, `SettleTimeout`
///    - Raised during staging, triggering, or waiting
///    - Always preceded by the unconditional unstage pass, so no device is
///      left holding resources
///
/// 3. **Post-acquisition errors** - `UnknownDetector`, `ArtifactIo`
///    - Raised while building the metadata artifact
///    - Frame data on disk remains valid; only the metadata step failed
///
/// Workflow dispatch failures are deliberately absent from this taxonomy:
/// they occur after data is durably written and surface only in logs.
#[derive(Error, Debug)]
pub enum AcquireError {
    /// Configuration file parsing failed.
    ///
    /// Occurs when loading TOML configuration that has syntax errors, missing
    /// required fields, or type mismatches.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Acquisition request or settings validation failed.
    ///
    /// Values parsed correctly but fail semantic validation, e.g. an empty
    /// target path or a non-positive frame count. Raised before any hardware
    /// interaction, so the caller can correct the request and retry.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A device's staging contract was violated.
    ///
    /// The five-field staging setup carried invalid contents (empty file
    /// name, zero images, non-positive exposure). This is a wiring bug in the
    /// calling code, not a runtime condition.
    #[error("Invalid staging argument: {0}")]
    InvalidArgument(String),

    /// The binary frame container could not be parsed.
    ///
    /// Raised when a header cannot be unpacked according to the expected
    /// field layout, when the declared payload overruns the file, or when an
    /// unsupported compression mode is encountered at read time. The
    /// container is treated as corrupt from `offset` on.
    #[error("Container format error at byte {offset}: {reason}")]
    Format {
        /// Byte offset of the header or payload that failed to parse.
        offset: u64,
        /// Human-readable description of the violation.
        reason: String,
    },

    /// A monitored readback failed to settle within the allotted time.
    ///
    /// Only raised when the caller asked for timeout to be fatal; otherwise
    /// the non-settled outcome is returned as a normal value.
    #[error(
        "'{name}' failed to settle after {elapsed:?}: readback {readback} vs target {target} (tolerance {tolerance})"
    )]
    SettleTimeout {
        /// Name of the monitored signal.
        name: String,
        /// Last readback value observed before the deadline.
        readback: f64,
        /// Target setpoint the readback was expected to reach.
        target: f64,
        /// Tolerance band around the target.
        tolerance: f64,
        /// Wall time spent waiting.
        elapsed: Duration,
    },

    /// No physical-parameter entry exists for the given detector number.
    #[error("Unknown detector number: {0}")]
    UnknownDetector(u32),

    /// Metadata artifact construction failed.
    ///
    /// Covers naming collisions (the target path already exists) and write
    /// failures. The orchestrator picks a free name beforehand, so a
    /// collision here means the caller bypassed that step.
    #[error("Metadata artifact error at '{}': {reason}", .path.display())]
    ArtifactIo {
        /// Artifact path that could not be written.
        path: PathBuf,
        /// Human-readable description of the failure.
        reason: String,
    },

    /// Communication with a detector or auxiliary device failed.
    ///
    /// Propagates to the caller only after the unconditional unstage pass has
    /// run, so no Resource/Datum accounting is leaked.
    #[error("Device error: {0}")]
    Device(String),

    /// `stage()` was called on a device that is already staged.
    ///
    /// A second stage without an intervening unstage would silently create a
    /// second live Resource, breaking at-most-once Datum delivery, so the
    /// call fails instead.
    #[error("Device '{0}' is already staged")]
    AlreadyStaged(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AcquireError {
    /// Shorthand for a [`AcquireError::Format`] at a known byte offset.
    pub fn format_at(offset: u64, reason: impl Into<String>) -> Self {
        Self::Format {
            offset,
            reason: reason.into(),
        }
    }

    /// True when the error was raised before any device was staged.
    ///
    /// Callers can retry these with a corrected request without touching
    /// hardware state.
    pub fn is_pre_hardware(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Configuration(_) | Self::InvalidArgument(_)
        )
    }
}
