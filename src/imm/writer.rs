//! Container writing.
//!
//! Writes the same header/payload stream the vendor detectors record. The
//! simulated detector uses this to produce real containers on disk, and the
//! round-trip tests use it to build synthetic fixtures.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};

use crate::error::{AcquireError, AppResult};
use crate::imm::header::{AuxEntry, ImmHeader};

/// Sequential writer producing sparse-compressed containers.
///
/// Every frame gets a full header; `buffer_number` counts up from zero and
/// `elapsed` measures from writer creation, matching what the vendor
/// recorder stamps.
#[derive(Debug)]
pub struct ImmWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    rows: u32,
    cols: u32,
    preset: f64,
    frames_written: u32,
    series_start: Instant,
    aux: Vec<AuxEntry>,
}

impl ImmWriter {
    /// Create a container at `path` for a `rows x cols` sensor with the
    /// given programmed exposure time in seconds.
    pub fn create<P: AsRef<Path>>(path: P, rows: u32, cols: u32, preset: f64) -> AppResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(AcquireError::InvalidArgument(format!(
                "degenerate geometry {}x{}",
                rows, cols
            )));
        }
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            rows,
            cols,
            preset,
            frames_written: 0,
            series_start: Instant::now(),
            aux: Vec::new(),
        })
    }

    /// Auxiliary named values stamped into every subsequent frame header.
    pub fn set_aux(&mut self, aux: Vec<AuxEntry>) {
        self.aux = aux;
    }

    /// Container path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frames written so far.
    pub fn frames_written(&self) -> u32 {
        self.frames_written
    }

    /// Append one sparse frame.
    ///
    /// `indices` are row-major pixel positions (`row * cols + col`), paired
    /// positionally with `values`.
    pub fn write_sparse_frame(&mut self, indices: &[u32], values: &[u16]) -> AppResult<()> {
        if indices.len() != values.len() {
            return Err(AcquireError::InvalidArgument(format!(
                "{} pixel indices paired with {} values",
                indices.len(),
                values.len()
            )));
        }
        let pixels = self.rows as u64 * self.cols as u64;
        if let Some(bad) = indices.iter().find(|&&i| u64::from(i) >= pixels) {
            return Err(AcquireError::InvalidArgument(format!(
                "pixel index {} outside {}x{} sensor",
                bad, self.rows, self.cols
            )));
        }

        let mut header = ImmHeader::sparse(self.rows, self.cols, indices.len() as u32);
        header.buffer_number = self.frames_written;
        header.epoch_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        header.elapsed = self.series_start.elapsed().as_secs_f64();
        header.preset = self.preset;
        header.aux = self.aux.clone();

        self.writer.write_all(&header.encode()?)?;

        let mut payload = BytesMut::with_capacity(indices.len() * 6);
        for &index in indices {
            payload.put_u32_le(index);
        }
        for &value in values {
            payload.put_u16_le(value);
        }
        self.writer.write_all(&payload)?;

        self.frames_written += 1;
        Ok(())
    }

    /// Append one frame given as a dense row-major image, keeping only the
    /// non-zero pixels.
    pub fn write_dense_frame(&mut self, pixels: &[u16]) -> AppResult<()> {
        let expected = self.rows as usize * self.cols as usize;
        if pixels.len() != expected {
            return Err(AcquireError::InvalidArgument(format!(
                "dense frame has {} pixels, sensor is {}x{}",
                pixels.len(),
                self.rows,
                self.cols
            )));
        }

        let mut indices = Vec::new();
        let mut values = Vec::new();
        for (i, &value) in pixels.iter().enumerate() {
            if value != 0 {
                indices.push(i as u32);
                values.push(value);
            }
        }
        self.write_sparse_frame(&indices, &values)
    }

    /// Flush and close the container.
    pub fn finish(mut self) -> AppResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}
