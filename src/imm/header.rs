//! Container header encode/decode.
//!
//! Every frame in a container is preceded by a fixed 1024-byte header. All
//! integer and float fields are little-endian. Layout:
//!
//! | offset | size | field |
//! |--------|------|-------|
//! | 0      | 4    | `mode` (u32) |
//! | 4      | 4    | `compression` (u32, 0 = none, 6 = sparse) |
//! | 8      | 4    | `row_beg` (u32) |
//! | 12     | 4    | `row_end` (u32) |
//! | 16     | 4    | `col_beg` (u32) |
//! | 20     | 4    | `col_end` (u32) |
//! | 24     | 4    | `row_bin` (u32) |
//! | 28     | 4    | `col_bin` (u32) |
//! | 32     | 4    | `rows` (u32) |
//! | 36     | 4    | `cols` (u32) |
//! | 40     | 4    | `bytes_per_pixel` (u32) |
//! | 44     | 4    | `dlen` (u32, element count) |
//! | 48     | 4    | `buffer_number` (u32) |
//! | 52     | 4    | `roi_number` (u32) |
//! | 56     | 8    | `epoch_ns` (u64, acquisition timestamp) |
//! | 64     | 8    | `elapsed` (f64, seconds since series start) |
//! | 72     | 8    | `preset` (f64, programmed exposure seconds) |
//! | 80     | 4    | `corecotick` (u32) |
//! | 84     | 4    | `camera_type` (u32) |
//! | 88     | 4    | `imm_version` (u32) |
//! | 92     | 320  | ten aux entries, 32 bytes each (24-byte name + f64) |
//! | 412    | 612  | reserved, zero |

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{AcquireError, AppResult};

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 1024;

/// Number of auxiliary named-value slots in a header.
pub const AUX_SLOTS: usize = 10;

/// Bytes reserved for an auxiliary entry name (NUL-padded).
const AUX_NAME_LEN: usize = 24;

/// Byte offset of the first auxiliary entry.
const AUX_OFFSET: usize = 92;

/// Payload compression mode declared by a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Raw `u16` pixels, 2 bytes per element.
    None,
    /// Sparse coordinate/value pairs, 6 bytes per element.
    Sparse,
}

impl Compression {
    /// On-disk discriminant.
    pub fn code(self) -> u32 {
        match self {
            Compression::None => 0,
            Compression::Sparse => 6,
        }
    }

    /// Payload bytes per declared element.
    pub fn bytes_per_element(self) -> usize {
        match self {
            Compression::None => 2,
            Compression::Sparse => 6,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Compression::None),
            6 => Some(Compression::Sparse),
            _ => None,
        }
    }
}

/// One auxiliary named value carried in a header.
///
/// The recording side uses these for transient beamline quantities
/// (ring current, sample temperature) captured per frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AuxEntry {
    /// Entry name, at most 23 bytes once encoded.
    pub name: String,
    /// Entry value.
    pub value: f64,
}

/// Decoded container header.
#[derive(Debug, Clone, PartialEq)]
pub struct ImmHeader {
    /// Camera readout mode as recorded by the vendor software.
    pub mode: u32,
    /// Payload compression of the frame that follows.
    pub compression: Compression,
    /// First sensor row of the recorded region.
    pub row_beg: u32,
    /// Last sensor row of the recorded region.
    pub row_end: u32,
    /// First sensor column of the recorded region.
    pub col_beg: u32,
    /// Last sensor column of the recorded region.
    pub col_end: u32,
    /// Row binning factor.
    pub row_bin: u32,
    /// Column binning factor.
    pub col_bin: u32,
    /// Image height in pixels.
    pub rows: u32,
    /// Image width in pixels.
    pub cols: u32,
    /// Stored intensity width in bytes.
    pub bytes_per_pixel: u32,
    /// Payload element count.
    pub dlen: u32,
    /// Vendor frame-buffer sequence number.
    pub buffer_number: u32,
    /// ROI index the frame belongs to.
    pub roi_number: u32,
    /// Acquisition timestamp, nanoseconds since the Unix epoch.
    pub epoch_ns: u64,
    /// Seconds elapsed since the start of the series.
    pub elapsed: f64,
    /// Programmed exposure time in seconds.
    pub preset: f64,
    /// Vendor clock tick at readout.
    pub corecotick: u32,
    /// Vendor camera model code.
    pub camera_type: u32,
    /// Container format revision.
    pub imm_version: u32,
    /// Auxiliary named values, at most [`AUX_SLOTS`].
    pub aux: Vec<AuxEntry>,
}

impl ImmHeader {
    /// Current container format revision written by [`encode`](Self::encode).
    pub const VERSION: u32 = 32;

    /// Header for a sparse frame covering the full sensor.
    pub fn sparse(rows: u32, cols: u32, dlen: u32) -> Self {
        Self {
            mode: 2,
            compression: Compression::Sparse,
            row_beg: 0,
            row_end: rows.saturating_sub(1),
            col_beg: 0,
            col_end: cols.saturating_sub(1),
            row_bin: 1,
            col_bin: 1,
            rows,
            cols,
            bytes_per_pixel: 2,
            dlen,
            buffer_number: 0,
            roi_number: 0,
            epoch_ns: 0,
            elapsed: 0.0,
            preset: 0.0,
            corecotick: 0,
            camera_type: 0,
            imm_version: Self::VERSION,
            aux: Vec::new(),
        }
    }

    /// Payload size in bytes declared by this header.
    pub fn payload_len(&self) -> usize {
        self.dlen as usize * self.compression.bytes_per_element()
    }

    /// Decode a header from the first [`HEADER_LEN`] bytes of `buf`.
    ///
    /// `file_offset` is the header's position in the container, used only for
    /// error reporting.
    pub fn decode(buf: &[u8], file_offset: u64) -> AppResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(AcquireError::format_at(
                file_offset,
                format!(
                    "truncated header: {} bytes remain, {} required",
                    buf.len(),
                    HEADER_LEN
                ),
            ));
        }

        let mut cur = &buf[..HEADER_LEN];
        let mode = cur.get_u32_le();
        let compression_code = cur.get_u32_le();
        let compression = Compression::from_code(compression_code).ok_or_else(|| {
            AcquireError::format_at(
                file_offset,
                format!("unknown compression code {}", compression_code),
            )
        })?;
        let row_beg = cur.get_u32_le();
        let row_end = cur.get_u32_le();
        let col_beg = cur.get_u32_le();
        let col_end = cur.get_u32_le();
        let row_bin = cur.get_u32_le();
        let col_bin = cur.get_u32_le();
        let rows = cur.get_u32_le();
        let cols = cur.get_u32_le();
        let bytes_per_pixel = cur.get_u32_le();
        let dlen = cur.get_u32_le();
        let buffer_number = cur.get_u32_le();
        let roi_number = cur.get_u32_le();
        let epoch_ns = cur.get_u64_le();
        let elapsed = cur.get_f64_le();
        let preset = cur.get_f64_le();
        let corecotick = cur.get_u32_le();
        let camera_type = cur.get_u32_le();
        let imm_version = cur.get_u32_le();

        let mut aux = Vec::new();
        for slot in 0..AUX_SLOTS {
            let base = AUX_OFFSET + slot * (AUX_NAME_LEN + 8);
            let name_bytes = &buf[base..base + AUX_NAME_LEN];
            let end = name_bytes
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(AUX_NAME_LEN);
            if end == 0 {
                continue; // empty slot
            }
            let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
            let mut value_cur = &buf[base + AUX_NAME_LEN..base + AUX_NAME_LEN + 8];
            aux.push(AuxEntry {
                name,
                value: value_cur.get_f64_le(),
            });
        }

        Ok(Self {
            mode,
            compression,
            row_beg,
            row_end,
            col_beg,
            col_end,
            row_bin,
            col_bin,
            rows,
            cols,
            bytes_per_pixel,
            dlen,
            buffer_number,
            roi_number,
            epoch_ns,
            elapsed,
            preset,
            corecotick,
            camera_type,
            imm_version,
            aux,
        })
    }

    /// Encode this header into exactly [`HEADER_LEN`] bytes.
    ///
    /// Fails with `InvalidArgument` if more than [`AUX_SLOTS`] auxiliary
    /// entries are present or an entry name does not fit its slot.
    pub fn encode(&self) -> AppResult<Vec<u8>> {
        if self.aux.len() > AUX_SLOTS {
            return Err(AcquireError::InvalidArgument(format!(
                "{} aux entries exceed the {} header slots",
                self.aux.len(),
                AUX_SLOTS
            )));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN);
        buf.put_u32_le(self.mode);
        buf.put_u32_le(self.compression.code());
        buf.put_u32_le(self.row_beg);
        buf.put_u32_le(self.row_end);
        buf.put_u32_le(self.col_beg);
        buf.put_u32_le(self.col_end);
        buf.put_u32_le(self.row_bin);
        buf.put_u32_le(self.col_bin);
        buf.put_u32_le(self.rows);
        buf.put_u32_le(self.cols);
        buf.put_u32_le(self.bytes_per_pixel);
        buf.put_u32_le(self.dlen);
        buf.put_u32_le(self.buffer_number);
        buf.put_u32_le(self.roi_number);
        buf.put_u64_le(self.epoch_ns);
        buf.put_f64_le(self.elapsed);
        buf.put_f64_le(self.preset);
        buf.put_u32_le(self.corecotick);
        buf.put_u32_le(self.camera_type);
        buf.put_u32_le(self.imm_version);

        for entry in &self.aux {
            let name = entry.name.as_bytes();
            if name.len() >= AUX_NAME_LEN {
                return Err(AcquireError::InvalidArgument(format!(
                    "aux entry name '{}' exceeds {} bytes",
                    entry.name,
                    AUX_NAME_LEN - 1
                )));
            }
            buf.put_slice(name);
            buf.put_bytes(0, AUX_NAME_LEN - name.len());
            buf.put_f64_le(entry.value);
        }
        for _ in self.aux.len()..AUX_SLOTS {
            buf.put_bytes(0, AUX_NAME_LEN + 8);
        }

        buf.put_bytes(0, HEADER_LEN - buf.len());
        Ok(buf.to_vec())
    }
}
