//! Camera acquisition core for an experiment-orchestration runtime.
//!
//! Frames are too large for the event stream, so each one is appended to a per-session
//! dataset file and the stream carries a small datum document pointing at its row. This
//! library contains the staged acquisition device, the frame store, the asset document
//! model and the lazy read-back path. It is used by the `basler_daq` binary and by any
//! runtime embedding the detector.

pub mod config;
pub mod core;
pub mod data;
pub mod detector;
pub mod error;
pub mod experiment;
pub mod handler;
pub mod instrument;
pub mod logging;

pub use crate::detector::{CameraDetector, DetectorConfig, DetectorState};
pub use crate::error::{AppResult, DaqError};
