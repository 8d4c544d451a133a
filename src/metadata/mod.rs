//! Metadata registry, detector parameter table, and artifact builder.
//!
//! The registry holds the typed named fields captured around an
//! acquisition; the detector table supplies static physical parameters per
//! detector number; the artifact module snapshots both into the structured
//! file handed to the downstream analysis pipeline.

pub mod artifact;
pub mod detectors;
pub mod registry;

pub use artifact::{free_artifact_path, MetadataArtifact};
pub use detectors::{DetectorPhysical, DetectorTable};
pub use registry::{fields, FieldValue, MetadataRegistry};
