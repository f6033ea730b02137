//! Camera contract and the emulated camera used by tests and the CLI.

pub mod camera;
pub mod mock;

pub use camera::{
    clamp_to_range, Camera, CameraInfo, CameraSettings, ConfigurationClampWarning, PixelFormat,
    TriggerMode,
};
pub use mock::{MockCamera, MockGrab};
