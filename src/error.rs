//! Custom error types for the crate.
//!
//! This module defines the primary error type, `DaqError`, shared by every layer of the
//! acquisition path. Using the `thiserror` crate, it provides a centralized and consistent
//! way to report failures, from frame store I/O to camera timeouts and lazy read-back.
//!
//! ## Error Hierarchy
//!
//! `DaqError` consolidates the following groups:
//!
//! - **Lifecycle**: `Stage`, `Unstage` and `InvalidState` describe failures of the staged
//!   acquisition state machine. `Stage` wraps the cause that aborted session setup, while
//!   `Unstage` collects every close/flush failure seen during best-effort cleanup.
//! - **Camera**: `CameraOpen`, `GrabTimeout`, `UnsupportedFormat` and `Camera` originate
//!   from the camera contract. A `GrabTimeout` is reported per trigger and never retried here.
//! - **Frame store**: `StoreCreate`, `ShapeMismatch`, `DtypeMismatch`, `Index`, `StoreClosed`,
//!   `StoreLost`, `ReadOnly` and `Corrupt` cover the append-only dataset file. `Hdf5` wraps
//!   library failures of the HDF5 backend, and `FeatureNotEnabled` reports a backend that was
//!   compiled out.
//! - **Assets**: `Resolve`, `UnknownSpec`, `HandlerExists`, `UnknownResource` and
//!   `UnknownDatum` come from the handler registry and the resolver.
//! - **Plumbing**: `Io`, `Json`, `Config` and `Configuration` wrap lower-level failures.
//!
//! By using `#[from]`, `DaqError` can be created from the wrapped error types with the `?`
//! operator.

use crate::core::{Dtype, FrameShape};
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors produced by the acquisition, storage and resolution paths.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Session setup failed; the detector remains idle.
    #[error("Stage failed: {0}")]
    Stage(#[source] Box<DaqError>),

    /// Cleanup during unstage hit one or more failures; the detector is idle regardless.
    #[error("Unstage failed with {} error(s)", .0.len())]
    Unstage(Vec<DaqError>),

    /// A lifecycle operation was called in the wrong state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the detector was in.
        state: &'static str,
    },

    /// The camera could not be opened.
    #[error("Camera open failed: {0}")]
    CameraOpen(String),

    /// The camera did not deliver a frame within the grab timeout.
    #[error("Camera did not deliver a frame within {timeout_ms} ms")]
    GrabTimeout {
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The requested pixel format is not offered by the camera.
    #[error("Pixel format '{requested}' is not supported (supported: {supported})")]
    UnsupportedFormat {
        /// Requested format name.
        requested: String,
        /// Comma-separated supported format names.
        supported: String,
    },

    /// Any other camera-side failure.
    #[error("Camera error: {0}")]
    Camera(String),

    /// A frame was built from an inconsistent pixel buffer.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// The frame store file could not be created.
    #[error("Cannot create frame store at {}: {source}", path.display())]
    StoreCreate {
        /// Target file path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A frame does not match the store's fixed shape.
    #[error("Frame shape {actual} does not match session shape {expected}")]
    ShapeMismatch {
        /// Shape fixed at store creation.
        expected: FrameShape,
        /// Shape of the offending frame.
        actual: FrameShape,
    },

    /// A frame does not match the store's sample type.
    #[error("Frame dtype {actual} does not match store dtype {expected}")]
    DtypeMismatch {
        /// Dtype fixed at store creation.
        expected: Dtype,
        /// Dtype of the offending frame.
        actual: Dtype,
    },

    /// Row index past the end of the dataset.
    #[error("Frame index {index} out of range (dataset holds {len} frames)")]
    Index {
        /// Requested row.
        index: u64,
        /// Number of committed rows.
        len: u64,
    },

    /// The frame store handle was already closed.
    #[error("Frame store is closed")]
    StoreClosed,

    /// The dataset file disappeared from its path while the store was open.
    #[error("Frame store file {} was removed while open", path.display())]
    StoreLost {
        /// Path the store was created at.
        path: PathBuf,
    },

    /// A write was attempted through a read-only handle.
    #[error("Frame store opened read-only")]
    ReadOnly,

    /// The dataset file does not follow the expected layout.
    #[error("Corrupt frame store: {0}")]
    Corrupt(String),

    /// HDF5 library error.
    #[cfg(feature = "storage_hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    /// The operation needs a cargo feature this build does not have.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// Lazy read-back of a frame failed.
    #[error("Cannot resolve frame from {}: {source}", path.display())]
    Resolve {
        /// File named by the resource document.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: Box<DaqError>,
    },

    /// No handler registered for a resource spec tag.
    #[error("No handler registered for spec '{0}'")]
    UnknownSpec(String),

    /// A handler is already registered for the spec tag.
    #[error("Handler for spec '{0}' already registered")]
    HandlerExists(String),

    /// A datum referenced a resource that was never seen.
    #[error("Unknown resource '{0}'")]
    UnknownResource(String),

    /// A datum id was never seen.
    #[error("Unknown datum '{0}'")]
    UnknownDatum(String),

    /// Configuration loading error.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Semantic configuration error.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Wraps `self` as the cause of a failed stage.
    pub fn into_stage(self) -> Self {
        match self {
            DaqError::Stage(_) => self,
            other => DaqError::Stage(Box::new(other)),
        }
    }

    /// Returns the error that aborted a stage, if this is a stage failure.
    pub fn stage_cause(&self) -> Option<&DaqError> {
        match self {
            DaqError::Stage(cause) => Some(cause),
            _ => None,
        }
    }
}
