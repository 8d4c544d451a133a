//! # XPCS DAQ Core Library
//!
//! Acquisition orchestration for an X-ray Photon Correlation Spectroscopy
//! beamline: area-detector staging and triggering, sparse-frame container
//! I/O, per-run metadata capture, and hand-off of finished artifacts to the
//! data-management workflow engine.
//!
//! ## Crate Structure
//!
//! - [`acquire`] - Acquisition requests, the run state machine, and the
//!   document stream describing each run
//! - [`config`] - Layered TOML and environment configuration
//! - [`device`] - The [`device::Device`] and [`device::AreaDetector`] traits
//!   plus the detector families that implement them
//! - [`error`] - Error types shared across the crate
//! - [`imm`] - IMM sparse-frame container reader and writer
//! - [`logging`] - Tracing subscriber setup
//! - [`metadata`] - Per-run metadata registry and artifact construction
//! - [`retry`] - Bounded retry policy for flaky external calls
//! - [`settle`] - Positioner settle-wait with tolerance checking
//! - [`signal`] - Observable typed process variables
//! - [`workflow`] - Post-run workflow dispatch bridge

pub mod acquire;
pub mod config;
pub mod device;
pub mod error;
pub mod imm;
pub mod logging;
pub mod metadata;
pub mod retry;
pub mod settle;
pub mod signal;
pub mod workflow;

pub use acquire::{AcquisitionRequest, Orchestrator, RunSummary};
pub use config::Settings;
pub use error::{AcquireError, AppResult};
pub use signal::Signal;
