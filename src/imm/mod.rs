//! Sparse frame container ("IMM") support.
//!
//! The beamline detectors record series of images into a vendor binary
//! container: a fixed 1024-byte header per frame followed immediately by the
//! frame payload. Compressed frames store `dlen` sparse coordinate/value
//! pairs (a `u32` pixel index and a `u16` intensity each); uncompressed
//! frames store `dlen` raw `u16` pixels. The layout is externally fixed and
//! read bit-exact, little-endian throughout.
//!
//! [`ImmReader`] builds a table of contents by sequentially scanning headers
//! and materializes dense arrays on demand. [`ImmWriter`] produces the same
//! format and backs the simulated detector and the round-trip tests.

pub mod header;
pub mod reader;
pub mod writer;

pub use header::{AuxEntry, Compression, ImmHeader, HEADER_LEN};
pub use reader::{DenseFrames, FrameEntry, ImmReader};
pub use writer::ImmWriter;
