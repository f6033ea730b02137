//! Core frame types shared by the camera, the frame store and the resolver.
//!
//! A [`Frame`] is a row-major 2D grid of samples with a fixed [`FrameShape`]. The samples
//! live in a [`PixelBuffer`], which keeps the camera's native sample type instead of
//! widening everything to `f64`.
//!
//! # Data Flow
//!
//! ```text
//! Camera --[Frame]--> FrameStore::append --> row N-1 on disk
//!                                  ^
//! FrameResolver::resolve <---------+ (FrameStore::read)
//! ```

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

// =============================================================================
// Sample types
// =============================================================================

/// Numeric type of the samples in a frame, as persisted on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dtype {
    /// 8-bit unsigned integer samples.
    #[serde(rename = "uint8")]
    U8,
    /// 16-bit unsigned integer samples.
    #[serde(rename = "uint16")]
    U16,
    /// 64-bit floating point samples (computed images).
    #[serde(rename = "float64")]
    F64,
}

impl Dtype {
    /// Size of one sample in bytes.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Dtype::U8 => 1,
            Dtype::U16 => 2,
            Dtype::F64 => 8,
        }
    }

    /// On-disk type code.
    pub fn code(self) -> u8 {
        match self {
            Dtype::U8 => 0,
            Dtype::U16 => 1,
            Dtype::F64 => 2,
        }
    }

    /// Inverse of [`Dtype::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Dtype::U8),
            1 => Some(Dtype::U16),
            2 => Some(Dtype::F64),
            _ => None,
        }
    }

    /// Name used in documents and data keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Dtype::U8 => "uint8",
            Dtype::U16 => "uint16",
            Dtype::F64 => "float64",
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory-efficient pixel buffer supporting multiple bit depths.
///
/// `PixelBuffer` stores image data in its native format to avoid unnecessary
/// type conversions and memory bloat. Camera sensors typically output 8-bit
/// or 16-bit unsigned integers; `F64` is kept for computed images.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PixelBuffer {
    /// 8-bit unsigned integer pixels (1 byte/pixel)
    U8(Vec<u8>),
    /// 16-bit unsigned integer pixels (2 bytes/pixel)
    U16(Vec<u16>),
    /// 64-bit floating point pixels (8 bytes/pixel)
    F64(Vec<f64>),
}

impl PixelBuffer {
    /// Sample type of this buffer.
    pub fn dtype(&self) -> Dtype {
        match self {
            PixelBuffer::U8(_) => Dtype::U8,
            PixelBuffer::U16(_) => Dtype::U16,
            PixelBuffer::F64(_) => Dtype::F64,
        }
    }

    /// Returns pixel data as f64 slice, using zero-copy for F64 variant.
    ///
    /// For U8 and U16 variants, this allocates a new Vec and converts each
    /// pixel. For F64 variant, this returns a borrowed reference with no allocation.
    pub fn as_f64(&self) -> Cow<'_, [f64]> {
        match self {
            PixelBuffer::U8(data) => Cow::Owned(data.iter().map(|&v| v as f64).collect()),
            PixelBuffer::U16(data) => Cow::Owned(data.iter().map(|&v| v as f64).collect()),
            PixelBuffer::F64(data) => Cow::Borrowed(data.as_slice()),
        }
    }

    /// Returns the number of pixels in the buffer.
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len(),
            PixelBuffer::F64(data) => data.len(),
        }
    }

    /// Returns true if the buffer contains no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Arithmetic mean of all samples; `0.0` for an empty buffer.
    pub fn mean(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        let sum: f64 = match self {
            PixelBuffer::U8(data) => data.iter().map(|&v| v as u64).sum::<u64>() as f64,
            PixelBuffer::U16(data) => data.iter().map(|&v| v as u64).sum::<u64>() as f64,
            PixelBuffer::F64(data) => data.iter().sum(),
        };
        sum / self.len() as f64
    }

    /// Serializes the samples as little-endian bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            PixelBuffer::U8(data) => data.clone(),
            PixelBuffer::U16(data) => data.iter().flat_map(|v| v.to_le_bytes()).collect(),
            PixelBuffer::F64(data) => data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// Rebuilds a buffer from little-endian bytes.
    ///
    /// Returns `None` if `bytes` is not a whole number of samples.
    pub fn from_le_bytes(dtype: Dtype, bytes: &[u8]) -> Option<Self> {
        if bytes.len() % dtype.bytes_per_sample() != 0 {
            return None;
        }
        let buffer = match dtype {
            Dtype::U8 => PixelBuffer::U8(bytes.to_vec()),
            Dtype::U16 => PixelBuffer::U16(
                bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            Dtype::F64 => PixelBuffer::F64(
                bytes
                    .chunks_exact(8)
                    .map(|c| {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(c);
                        f64::from_le_bytes(raw)
                    })
                    .collect(),
            ),
        };
        Some(buffer)
    }
}

// =============================================================================
// Frames
// =============================================================================

/// Frame dimensions `(H, W)`, fixed for a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameShape {
    /// Rows.
    pub height: u32,
    /// Columns.
    pub width: u32,
}

impl FrameShape {
    /// Shape of `height` rows by `width` columns.
    pub const fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }

    /// Number of pixels in one frame.
    pub fn pixels(&self) -> usize {
        self.height as usize * self.width as usize
    }
}

impl fmt::Display for FrameShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.height, self.width)
    }
}

/// One camera frame: a row-major grid of samples of a known shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    shape: FrameShape,
    pixels: PixelBuffer,
}

impl Frame {
    /// Builds a frame, checking that the buffer holds exactly `H*W` samples.
    pub fn new(shape: FrameShape, pixels: PixelBuffer) -> AppResult<Self> {
        if pixels.len() != shape.pixels() {
            return Err(DaqError::InvalidFrame(format!(
                "{} samples cannot fill shape {}",
                pixels.len(),
                shape
            )));
        }
        Ok(Self { shape, pixels })
    }

    /// Frame filled with a constant `u8` value.
    pub fn filled_u8(shape: FrameShape, value: u8) -> Self {
        Self {
            shape,
            pixels: PixelBuffer::U8(vec![value; shape.pixels()]),
        }
    }

    /// Frame dimensions.
    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    /// Sample type.
    pub fn dtype(&self) -> Dtype {
        self.pixels.dtype()
    }

    /// Borrow the samples.
    pub fn pixels(&self) -> &PixelBuffer {
        &self.pixels
    }

    /// Take ownership of the samples.
    pub fn into_pixels(self) -> PixelBuffer {
        self.pixels
    }

    /// Mean intensity, the scalar summary recorded per trigger.
    pub fn mean(&self) -> f64 {
        self.pixels.mean()
    }

    /// Sample at `(row, col)` widened to `f64`.
    pub fn get(&self, row: u32, col: u32) -> Option<f64> {
        if row >= self.shape.height || col >= self.shape.width {
            return None;
        }
        let idx = row as usize * self.shape.width as usize + col as usize;
        match &self.pixels {
            PixelBuffer::U8(data) => data.get(idx).map(|&v| v as f64),
            PixelBuffer::U16(data) => data.get(idx).map(|&v| v as f64),
            PixelBuffer::F64(data) => data.get(idx).copied(),
        }
    }
}
