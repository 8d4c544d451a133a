//! Acquisition sequencing: requests, sessions, staging plans, documents,
//! and the orchestrator that ties them to devices.

pub mod documents;
pub mod orchestrator;
pub mod request;
pub mod session;
pub mod staging;

pub use documents::{
    AssetBundle, AssetCache, DatumDoc, Document, ResourceDoc, RunStartDoc, RunStopDoc,
};
pub use orchestrator::{AcquirePhase, BeamlineSignals, Orchestrator, RunSummary};
pub use request::AcquisitionRequest;
pub use session::{
    AcquisitionMode, BurstWindow, DetectorSession, ImageMode, KineticsWindow, RoiBounds,
    TriggerSource,
};
pub use staging::{Directive, DirectiveSink, StagingPlan};
