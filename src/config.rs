//! Configuration using Figment.
//!
//! Settings are layered, lowest precedence first:
//! 1. Built-in defaults
//! 2. `config/basler_daq.toml` (or an explicit file)
//! 3. Environment variables prefixed with `BASLER_DAQ_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! BASLER_DAQ_APPLICATION__LOG_LEVEL=debug
//! BASLER_DAQ_STORAGE__ROOT_DIR=/data/basler
//! BASLER_DAQ_CAMERA__EXPOSURE_MS=2.5
//! ```
//!
//! # Example
//!
//! ```no_run
//! use basler_daq::config::Settings;
//!
//! let settings = Settings::load().unwrap();
//! println!("Storing under {}", settings.storage.root_dir.display());
//! ```

use crate::data::{Compression, StorageFormat, StoreOptions};
use crate::detector::DetectorConfig;
use crate::error::{AppResult, DaqError};
use crate::handler::{HandlerRegistry, FRAME_STORE_SPEC};
use crate::instrument::{CameraSettings, PixelFormat, TriggerMode};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/basler_daq.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "BASLER_DAQ_";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Where and how frames are stored
    pub storage: StorageConfig,
    /// Camera settings applied at stage
    pub camera: CameraConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Detector name, used as data key prefix
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "basler_cam".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the date-partitioned session tree
    pub root_dir: PathBuf,
    /// File format of new session files (frm, hdf5)
    pub format: StorageFormat,
    /// Row compression of new session files (lz4 for frm, deflate for hdf5, none)
    pub compression: Compression,
    /// Spec tag stamped on resource documents
    pub spec_tag: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("data"),
            format: StorageFormat::Frm,
            compression: Compression::Lz4,
            spec_tag: FRAME_STORE_SPEC.to_string(),
        }
    }
}

/// Camera configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Exposure time in milliseconds
    pub exposure_ms: f64,
    /// Pixel format
    pub pixel_format: PixelFormat,
    /// Trigger mode
    pub trigger_mode: TriggerMode,
    /// Grab timeout in milliseconds
    pub grab_timeout_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        let camera = CameraSettings::default();
        Self {
            exposure_ms: camera.exposure_ms,
            pixel_format: camera.pixel_format,
            trigger_mode: camera.trigger_mode,
            grab_timeout_ms: 5_000,
        }
    }
}

impl Settings {
    /// Load configuration from `config/basler_daq.toml` and the environment.
    ///
    /// A missing file is not an error; the defaults apply.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path, then validate it.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Self::figment(path.as_ref()).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// The layered provider chain, for callers that merge further sources.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Grab timeout is non-zero
    /// - Exposure is positive
    /// - Spec tag is not empty
    /// - Storage format is compiled in and accepts the compression
    pub fn validate(&self) -> AppResult<()> {
        if !VALID_LOG_LEVELS.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.camera.grab_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "grab_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.camera.exposure_ms.is_nan() || self.camera.exposure_ms <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "Invalid exposure_ms {}. Must be > 0",
                self.camera.exposure_ms
            )));
        }

        if self.storage.spec_tag.trim().is_empty() {
            return Err(DaqError::Configuration(
                "spec_tag cannot be empty".to_string(),
            ));
        }

        self.store_options().validate().map_err(|e| match e {
            DaqError::FeatureNotEnabled(feature) => DaqError::Configuration(format!(
                "storage format 'hdf5' needs a build with the {feature} feature"
            )),
            other => other,
        })
    }

    /// Storage settings for the detector.
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            root_dir: self.storage.root_dir.clone(),
            grab_timeout: Duration::from_millis(self.camera.grab_timeout_ms),
            spec_tag: self.storage.spec_tag.clone(),
            store_options: self.store_options(),
            file_stem: None,
        }
    }

    /// Layout of new session files.
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            format: self.storage.format,
            compression: self.storage.compression,
            ..StoreOptions::default()
        }
    }

    /// Handler registry able to resolve resources stamped with the configured spec tag.
    pub fn handler_registry(&self) -> HandlerRegistry {
        HandlerRegistry::with_frame_store_spec(&self.storage.spec_tag)
    }

    /// Camera settings applied at stage.
    pub fn camera_settings(&self) -> CameraSettings {
        CameraSettings {
            exposure_ms: self.camera.exposure_ms,
            pixel_format: self.camera.pixel_format,
            trigger_mode: self.camera.trigger_mode,
        }
    }

    /// The settings rendered as TOML, in the layout of the config file.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.storage.spec_tag, "BASLER_CAM_LZ4");
        assert_eq!(settings.camera_settings(), CameraSettings::default());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_invalid_camera_values() {
        let mut settings = Settings::default();
        settings.camera.grab_timeout_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.camera.exposure_ms = 0.0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.camera.exposure_ms = f64::NAN;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.storage.spec_tag = " ".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_storage_format_and_compression_must_agree() {
        let mut settings = Settings::default();
        settings.storage.compression = Compression::Deflate;
        assert!(matches!(settings.validate(), Err(DaqError::Configuration(_))));

        settings.storage.format = StorageFormat::Hdf5;
        assert_eq!(
            settings.validate().is_ok(),
            cfg!(feature = "storage_hdf5")
        );
        assert_eq!(settings.detector_config().store_options.format, StorageFormat::Hdf5);
    }

    #[test]
    fn test_handler_registry_knows_configured_tag() {
        let mut settings = Settings::default();
        settings.storage.spec_tag = "BEAMLINE_7_CAM".to_string();
        let specs = settings.handler_registry().specs().join(",");
        assert!(specs.contains("BEAMLINE_7_CAM"));
        assert!(specs.contains(FRAME_STORE_SPEC));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let settings = Settings::load_from("does/not/exist.toml").unwrap();
            assert_eq!(settings, Settings::default());
            Ok(())
        });
    }

    #[test]
    fn test_file_and_env_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "basler.toml",
                r#"
                [storage]
                root_dir = "/data/frames"
                compression = "none"

                [camera]
                exposure_ms = 4.0
                pixel_format = "Mono12"
                "#,
            )?;
            jail.set_env("BASLER_DAQ_CAMERA__EXPOSURE_MS", "2.5");
            jail.set_env("BASLER_DAQ_APPLICATION__LOG_LEVEL", "debug");

            let settings = Settings::load_from("basler.toml").unwrap();
            assert_eq!(settings.storage.root_dir, PathBuf::from("/data/frames"));
            assert_eq!(settings.storage.compression, Compression::None);
            assert_eq!(settings.camera.pixel_format, PixelFormat::Mono12);
            assert_eq!(settings.camera.exposure_ms, 2.5);
            assert_eq!(settings.application.log_level, "debug");
            assert_eq!(settings.camera.grab_timeout_ms, 5_000);

            let detector = settings.detector_config();
            assert_eq!(detector.store_options.compression, Compression::None);
            assert_eq!(detector.grab_timeout, Duration::from_secs(5));
            Ok(())
        });
    }

    #[test]
    fn test_env_validation_failure() {
        Jail::expect_with(|jail| {
            jail.set_env("BASLER_DAQ_APPLICATION__LOG_LEVEL", "loud");
            assert!(matches!(
                Settings::load_from("none.toml"),
                Err(DaqError::Configuration(_))
            ));
            Ok(())
        });
    }

    #[test]
    fn test_toml_rendering_reloads() {
        Jail::expect_with(|jail| {
            let rendered = Settings::default().to_toml().unwrap();
            jail.create_file("rendered.toml", &rendered)?;
            assert_eq!(
                Settings::load_from("rendered.toml").unwrap(),
                Settings::default()
            );
            Ok(())
        });
    }
}
