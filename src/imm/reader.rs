//! Random-access container reading.
//!
//! A container is a sequential stream of header/payload records with no
//! trailing index, so random access requires a table of contents built by
//! scanning headers once at open time. The file is memory-mapped read-only;
//! frame payloads are decoded straight out of the mapping.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{AcquireError, AppResult};
use crate::imm::header::{Compression, ImmHeader, HEADER_LEN};

/// Maximum supported width/height for a frame.
const MAX_DIMENSION: u32 = 65_536;
/// Maximum dense pixel payload for a single frame, in bytes.
const MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;

/// Validate declared detector geometry before any buffer is sized from it.
///
/// A corrupt container can claim arbitrary `rows`/`cols`; sizing a dense
/// buffer from unchecked values panics on capacity overflow instead of
/// failing like every other corruption.
fn validate_geometry(rows: u32, cols: u32) -> AppResult<usize> {
    if rows > MAX_DIMENSION || cols > MAX_DIMENSION {
        return Err(AcquireError::format_at(
            0,
            format!("geometry {rows}x{cols} exceeds maximum {MAX_DIMENSION} per dimension"),
        ));
    }
    let pixels = (rows as usize).checked_mul(cols as usize).ok_or_else(|| {
        AcquireError::format_at(0, format!("pixel count overflow for geometry {rows}x{cols}"))
    })?;
    let bytes = pixels
        .checked_mul(std::mem::size_of::<u16>())
        .ok_or_else(|| {
            AcquireError::format_at(0, format!("byte size overflow for geometry {rows}x{cols}"))
        })?;
    if bytes > MAX_FRAME_BYTES {
        return Err(AcquireError::format_at(
            0,
            format!("dense frame of {bytes} bytes exceeds maximum {MAX_FRAME_BYTES}"),
        ));
    }
    Ok(pixels)
}

/// One table-of-contents entry: where a physical frame's header starts and
/// how many payload elements it declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameEntry {
    /// Byte offset of the frame header in the container.
    pub offset: u64,
    /// Declared payload element count.
    pub dlen: u32,
}

/// Dense pixel data for one logical point.
///
/// Holds `frames_per_point` consecutive images of `rows * cols` pixels each,
/// stored frame-major as `u16` intensities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenseFrames {
    frames: usize,
    rows: usize,
    cols: usize,
    data: Vec<u16>,
}

impl DenseFrames {
    fn zeroed(frames: usize, rows: usize, cols: usize) -> Option<Self> {
        let len = frames.checked_mul(rows)?.checked_mul(cols)?;
        Some(Self {
            frames,
            rows,
            cols,
            data: vec![0; len],
        })
    }

    /// Number of frames held.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Image height in pixels.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Image width in pixels.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Intensity at (frame, row, col).
    pub fn get(&self, frame: usize, row: usize, col: usize) -> u16 {
        self.data[frame * self.rows * self.cols + row * self.cols + col]
    }

    /// One frame's pixels as a flat row-major slice.
    pub fn frame_slice(&self, frame: usize) -> &[u16] {
        let pixels = self.rows * self.cols;
        &self.data[frame * pixels..(frame + 1) * pixels]
    }

    /// All pixels, frame-major.
    pub fn as_slice(&self) -> &[u16] {
        &self.data
    }

    /// Scatter one sparse element into `frame`. Last write wins on duplicate
    /// pixel indices, matching the source format's semantics.
    fn scatter(&mut self, frame: usize, pixel: usize, value: u16) {
        self.data[frame * self.rows * self.cols + pixel] = value;
    }
}

/// Random-access reader over a sparse frame container.
///
/// ```rust,ignore
/// let mut reader = ImmReader::open("/data/run1/A001_00001-00050.imm", 1)?;
/// let point = reader.read(0)?;
/// println!("{} x {} pixels", point.rows(), point.cols());
/// reader.close();
/// ```
#[derive(Debug)]
pub struct ImmReader {
    path: PathBuf,
    map: Option<Mmap>,
    index: Vec<FrameEntry>,
    rows: u32,
    cols: u32,
    compression: Compression,
    frames_per_point: usize,
}

impl ImmReader {
    /// Open a container and build its table of contents.
    ///
    /// The first header determines the detector geometry and compression for
    /// the whole file; a mid-stream header that disagrees means the container
    /// is corrupt. Scanning stops when fewer than 4 bytes remain; any other
    /// parse failure is fatal, no partial index is kept.
    pub fn open<P: AsRef<Path>>(path: P, frames_per_point: usize) -> AppResult<Self> {
        if frames_per_point == 0 {
            return Err(AcquireError::Configuration(
                "frames_per_point must be at least 1".into(),
            ));
        }

        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // SAFETY: read-only mapping; containers are immutable once recorded
        let map = unsafe { Mmap::map(&file)? };

        let first = ImmHeader::decode(&map, 0)?;
        if first.rows == 0 || first.cols == 0 {
            return Err(AcquireError::format_at(
                0,
                format!("degenerate geometry {}x{}", first.rows, first.cols),
            ));
        }
        validate_geometry(first.rows, first.cols)?;

        let index = Self::build_index(&map, &first)?;

        Ok(Self {
            path,
            map: Some(map),
            index,
            rows: first.rows,
            cols: first.cols,
            compression: first.compression,
            frames_per_point,
        })
    }

    fn build_index(map: &Mmap, first: &ImmHeader) -> AppResult<Vec<FrameEntry>> {
        let file_len = map.len() as u64;
        let mut index = Vec::new();
        let mut offset = 0u64;

        // Fewer than 4 bytes left is the end-of-stream condition; anything
        // between that and a full valid record is corruption.
        while file_len - offset >= 4 {
            let header = ImmHeader::decode(&map[offset as usize..], offset)?;
            if header.rows != first.rows
                || header.cols != first.cols
                || header.compression != first.compression
            {
                return Err(AcquireError::format_at(
                    offset,
                    format!(
                        "header disagrees with first frame: {}x{} {:?} vs {}x{} {:?}",
                        header.rows,
                        header.cols,
                        header.compression,
                        first.rows,
                        first.cols,
                        first.compression
                    ),
                ));
            }

            let payload_len = header.payload_len() as u64;
            let payload_end = offset + HEADER_LEN as u64 + payload_len;
            if payload_end > file_len {
                return Err(AcquireError::format_at(
                    offset,
                    format!(
                        "payload overruns file: needs {} bytes, {} remain",
                        payload_len,
                        file_len - offset - HEADER_LEN as u64
                    ),
                ));
            }

            index.push(FrameEntry {
                offset,
                dlen: header.dlen,
            });
            offset = payload_end;
        }

        Ok(index)
    }

    /// Container path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total physical frames in the container.
    pub fn frame_count(&self) -> usize {
        self.index.len()
    }

    /// Logical points available (`frame_count / frames_per_point`, whole
    /// points only).
    pub fn point_count(&self) -> usize {
        self.index.len() / self.frames_per_point
    }

    /// Image height in pixels.
    pub fn rows(&self) -> u32 {
        self.rows
    }

    /// Image width in pixels.
    pub fn cols(&self) -> u32 {
        self.cols
    }

    /// Payload compression declared by the container.
    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// The table of contents, one entry per physical frame in file order.
    pub fn index(&self) -> &[FrameEntry] {
        &self.index
    }

    /// Decode the header of physical frame `frame`.
    pub fn header(&self, frame: usize) -> AppResult<ImmHeader> {
        let map = self.require_open()?;
        let entry = self.index.get(frame).ok_or_else(|| {
            AcquireError::Configuration(format!(
                "frame {} out of range: container holds {}",
                frame,
                self.index.len()
            ))
        })?;
        ImmHeader::decode(&map[entry.offset as usize..], entry.offset)
    }

    /// Materialize the dense pixel data for one logical point.
    ///
    /// Reads `frames_per_point` consecutive physical frames starting at
    /// `logical_index * frames_per_point` and scatters each frame's sparse
    /// elements into a zero-initialized buffer. Duplicate pixel indices are
    /// last-write-wins, never summed.
    ///
    /// Dense (uncompressed) containers are indexable but not reconstructable
    /// here; reading one is a format error, not a guess at the layout.
    pub fn read(&self, logical_index: usize) -> AppResult<DenseFrames> {
        let map = self.require_open()?;

        let start = logical_index * self.frames_per_point;
        let end = start + self.frames_per_point;
        if end > self.index.len() {
            return Err(AcquireError::Configuration(format!(
                "logical point {} out of range: container holds {} frames at {} per point",
                logical_index,
                self.index.len(),
                self.frames_per_point
            )));
        }

        if self.compression == Compression::None {
            return Err(AcquireError::format_at(
                self.index[start].offset,
                "dense payload reconstruction is not supported for uncompressed containers",
            ));
        }

        let rows = self.rows as usize;
        let cols = self.cols as usize;
        let pixels = rows * cols;
        let mut dense =
            DenseFrames::zeroed(self.frames_per_point, rows, cols).ok_or_else(|| {
                AcquireError::format_at(
                    self.index[start].offset,
                    format!(
                        "dense buffer overflow: {} frames of {rows}x{cols}",
                        self.frames_per_point
                    ),
                )
            })?;

        for (slot, entry) in self.index[start..end].iter().enumerate() {
            let dlen = entry.dlen as usize;
            let payload = entry.offset as usize + HEADER_LEN;
            let values_at = payload + 4 * dlen;

            for k in 0..dlen {
                let pixel_bytes = &map[payload + 4 * k..payload + 4 * k + 4];
                let value_bytes = &map[values_at + 2 * k..values_at + 2 * k + 2];
                let pixel = u32::from_le_bytes([
                    pixel_bytes[0],
                    pixel_bytes[1],
                    pixel_bytes[2],
                    pixel_bytes[3],
                ]) as usize;
                let value = u16::from_le_bytes([value_bytes[0], value_bytes[1]]);

                if pixel >= pixels {
                    return Err(AcquireError::format_at(
                        (payload + 4 * k) as u64,
                        format!("pixel index {} outside {}x{} sensor", pixel, rows, cols),
                    ));
                }
                dense.scatter(slot, pixel, value);
            }
        }

        Ok(dense)
    }

    /// Release the mapping. Idempotent; subsequent reads fail.
    pub fn close(&mut self) {
        self.map = None;
    }

    fn require_open(&self) -> AppResult<&Mmap> {
        self.map
            .as_ref()
            .ok_or_else(|| AcquireError::Io(std::io::Error::other("container reader is closed")))
    }
}
