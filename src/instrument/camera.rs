//! Camera contract consumed by the acquisition state machine.
//!
//! Hardware-agnostic interface for camera control and single-frame acquisition.
//! Implementations handle protocol-specific details; the detector only relies on the
//! operations below and on the advertised [`CameraInfo`] limits.
//!
//! Construction of a camera must never touch the hardware. Querying the device happens
//! in [`Camera::describe`], which the detector calls from an explicit `connect` step.

use crate::core::{Dtype, Frame, FrameShape};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Pixel format enumeration (extensible)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit monochrome
    Mono8,
    /// 10-bit monochrome, stored in 16-bit samples
    Mono10,
    /// 12-bit monochrome, stored in 16-bit samples
    Mono12,
    /// 16-bit monochrome
    Mono16,
}

impl PixelFormat {
    /// Vendor name of the format.
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Mono10 => "Mono10",
            PixelFormat::Mono12 => "Mono12",
            PixelFormat::Mono16 => "Mono16",
        }
    }

    /// Sample type frames of this format are stored with.
    pub fn dtype(&self) -> Dtype {
        match self {
            PixelFormat::Mono8 => Dtype::U8,
            PixelFormat::Mono10 | PixelFormat::Mono12 | PixelFormat::Mono16 => Dtype::U16,
        }
    }

    /// Largest sample value the format can carry.
    pub fn max_value(&self) -> u32 {
        match self {
            PixelFormat::Mono8 => 255,
            PixelFormat::Mono10 => 1023,
            PixelFormat::Mono12 => 4095,
            PixelFormat::Mono16 => 65535,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Mono8" => Ok(PixelFormat::Mono8),
            "Mono10" => Ok(PixelFormat::Mono10),
            "Mono12" => Ok(PixelFormat::Mono12),
            "Mono16" => Ok(PixelFormat::Mono16),
            other => Err(DaqError::Configuration(format!(
                "Unknown pixel format '{other}'"
            ))),
        }
    }
}

/// Trigger mode for frame acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerMode {
    /// Free-running; every grab is served by the camera's internal timing.
    Off,
    /// Frames wait for a hardware trigger edge.
    On,
}

impl TriggerMode {
    /// Vendor name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Off => "Off",
            TriggerMode::On => "On",
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings pushed to the camera at stage time.
///
/// This is the configuration surface exposed to the orchestration runtime; it can be
/// changed between `unstage` and the next `stage`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    /// Exposure time in milliseconds.
    pub exposure_ms: f64,
    /// Requested pixel format.
    pub pixel_format: PixelFormat,
    /// Trigger mode.
    pub trigger_mode: TriggerMode,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            exposure_ms: 10.0,
            pixel_format: PixelFormat::Mono8,
            trigger_mode: TriggerMode::Off,
        }
    }
}

/// Camera capabilities and hardware limits, as reported by [`Camera::describe`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    /// Model name.
    pub model: String,
    /// Serial number.
    pub serial: String,
    /// User-assigned device name.
    pub user_defined_name: String,
    /// Image width (X, columns) in pixels.
    pub width: u32,
    /// Image height (Y, rows) in pixels.
    pub height: u32,
    /// Minimum pixel level.
    pub pixel_min: u32,
    /// Maximum pixel level.
    pub pixel_max: u32,
    /// Shortest supported exposure.
    pub exposure_min_ms: f64,
    /// Longest supported exposure.
    pub exposure_max_ms: f64,
    /// Format active when the camera was described.
    pub active_format: PixelFormat,
    /// Formats the camera accepts.
    pub supported_formats: Vec<PixelFormat>,
    /// Transport payload size in bytes.
    pub payload_size: u64,
}

impl CameraInfo {
    /// Shape of the frames the camera currently produces.
    pub fn frame_shape(&self) -> FrameShape {
        FrameShape::new(self.height, self.width)
    }

    /// Fails with `UnsupportedFormat` if `format` is not offered.
    pub fn check_format(&self, format: PixelFormat) -> AppResult<()> {
        if self.supported_formats.contains(&format) {
            return Ok(());
        }
        Err(DaqError::UnsupportedFormat {
            requested: format.to_string(),
            supported: self
                .supported_formats
                .iter()
                .map(PixelFormat::as_str)
                .collect::<Vec<_>>()
                .join(", "),
        })
    }
}

/// Non-fatal notice that a requested value was clamped into the hardware range.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationClampWarning {
    /// Name of the clamped setting.
    pub parameter: &'static str,
    /// Value that was asked for.
    pub requested: f64,
    /// Value that will be used.
    pub applied: f64,
    /// Lower hardware bound.
    pub min: f64,
    /// Upper hardware bound.
    pub max: f64,
}

impl fmt::Display for ConfigurationClampWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} outside [{}, {}], clamped to {}",
            self.parameter, self.requested, self.min, self.max, self.applied
        )
    }
}

/// Clamps `requested` into `[min, max]`.
///
/// Returns the value to use, plus a warning when it differs from the request. A
/// non-finite request or an empty range (including NaN bounds) is a `Configuration` error.
pub fn clamp_to_range(
    parameter: &'static str,
    requested: f64,
    min: f64,
    max: f64,
) -> AppResult<(f64, Option<ConfigurationClampWarning>)> {
    if !requested.is_finite() {
        return Err(DaqError::Configuration(format!(
            "{parameter} must be a finite number, got {requested}"
        )));
    }
    if min.is_nan() || max.is_nan() || min > max {
        return Err(DaqError::Configuration(format!(
            "{parameter} range [{min}, {max}] reported by the camera is empty"
        )));
    }
    let applied = requested.clamp(min, max);
    if applied == requested {
        return Ok((requested, None));
    }
    let warning = ConfigurationClampWarning {
        parameter,
        requested,
        applied,
        min,
        max,
    };
    Ok((applied, Some(warning)))
}

/// Camera abstraction.
///
/// Every method takes `&mut self`: a camera is driven by exactly one owner, and calls are
/// sequential.
#[async_trait]
pub trait Camera: Send + Sync {
    /// Queries the device for its identity and limits.
    async fn describe(&mut self) -> AppResult<CameraInfo>;

    /// Opens the device for acquisition. Fails with `CameraOpen`.
    async fn open(&mut self) -> AppResult<()>;

    /// Closes the device. Closing a closed camera is a no-op.
    async fn close(&mut self) -> AppResult<()>;

    /// Applies exposure, pixel format and trigger mode.
    ///
    /// Fails with `UnsupportedFormat` if the format is not offered.
    async fn configure(&mut self, settings: &CameraSettings) -> AppResult<()>;

    /// Grabs one frame, failing with `GrabTimeout` if none arrives within `timeout`.
    async fn grab_one(&mut self, timeout: Duration) -> AppResult<Frame>;

    /// Whether the device is currently open.
    fn is_open(&self) -> bool;
}
