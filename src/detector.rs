//! Staged acquisition for one camera.
//!
//! `CameraDetector` is the device the orchestration runtime drives. It owns the camera,
//! the document composer and cache, and the session of the current stage.
//!
//! ```text
//!          stage()                 unstage()
//!   Idle ───────────▶ Staged ───────────────▶ Idle
//!                      │  ▲
//!                      └──┘ trigger()
//! ```
//!
//! Every frame goes to the session's [`FrameStore`] and only a datum document referencing
//! its row is queued for the event stream.

use crate::core::FrameShape;
use crate::data::{FrameStore, StorageFormat, StoreOptions};
use crate::error::{AppResult, DaqError};
use crate::experiment::document::{new_uid, now_ns};
use crate::experiment::{AssetCache, AssetComposer, AssetDocument, DataKey, ResourceDoc};
use crate::handler::FRAME_STORE_SPEC;
use crate::instrument::{
    clamp_to_range, Camera, CameraInfo, CameraSettings, ConfigurationClampWarning,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle state of a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DetectorState {
    /// No session; settings may change.
    Idle,
    /// A session is open and triggers are accepted.
    Staged,
}

impl DetectorState {
    fn as_str(&self) -> &'static str {
        match self {
            DetectorState::Idle => "idle",
            DetectorState::Staged => "staged",
        }
    }
}

/// Where and how sessions are stored.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Root directory; sessions land in `root_dir/YYYY/MM/DD/`.
    pub root_dir: PathBuf,
    /// Upper bound on a single grab.
    pub grab_timeout: Duration,
    /// Spec tag stamped on resource documents.
    pub spec_tag: String,
    /// Layout of the per-session dataset file.
    pub store_options: StoreOptions,
    /// Fixed file stem for session files; the session id when unset.
    pub file_stem: Option<String>,
}

impl DetectorConfig {
    /// Config storing under `root_dir` with default timeout and layout.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    /// Same config writing every session to `<stem>.<ext>`.
    pub fn with_file_stem(mut self, stem: impl Into<String>) -> Self {
        self.file_stem = Some(stem.into());
        self
    }

    /// Same config with a different grab timeout.
    pub fn with_grab_timeout(mut self, timeout: Duration) -> Self {
        self.grab_timeout = timeout;
        self
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            root_dir: std::env::temp_dir().join("basler_daq"),
            grab_timeout: Duration::from_millis(5_000),
            spec_tag: FRAME_STORE_SPEC.to_string(),
            store_options: StoreOptions::default(),
            file_stem: None,
        }
    }
}

/// Result of one successful trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerStatus {
    /// Row the frame was stored at.
    pub frame_index: u64,
    /// Datum queued for the frame.
    pub datum_id: String,
    /// Mean intensity of the frame.
    pub mean: f64,
}

/// Event values recorded by the last trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// Datum id standing in for the image.
    pub datum_id: String,
    /// Mean intensity.
    pub mean: f64,
    /// Frame shape.
    pub shape: FrameShape,
    /// Acquisition time, ns since the Unix epoch.
    pub time_ns: u64,
}

/// What a closed session produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    /// Session identifier.
    pub session_id: String,
    /// Dataset file.
    pub path: PathBuf,
    /// Frames written.
    pub frames: u64,
}

#[derive(Debug)]
struct Session {
    id: String,
    store: FrameStore,
    resource: ResourceDoc,
    frame_counter: u64,
}

/// Staged-acquisition device wrapping a [`Camera`].
#[derive(Debug)]
pub struct CameraDetector<C: Camera> {
    name: String,
    camera: C,
    settings: CameraSettings,
    config: DetectorConfig,
    info: Option<CameraInfo>,
    /// Settings last pushed to the hardware.
    applied: Option<CameraSettings>,
    composer: AssetComposer,
    cache: AssetCache,
    session: Option<Session>,
    last_reading: Option<Reading>,
    warnings: Vec<ConfigurationClampWarning>,
}

impl<C: Camera> CameraDetector<C> {
    /// Creates an idle detector. No hardware or filesystem access happens here.
    pub fn new(name: impl Into<String>, camera: C, config: DetectorConfig) -> Self {
        let composer = AssetComposer::new(config.spec_tag.clone());
        Self {
            name: name.into(),
            camera,
            settings: CameraSettings::default(),
            config,
            info: None,
            applied: None,
            composer,
            cache: AssetCache::new(),
            session: None,
            last_reading: None,
            warnings: Vec::new(),
        }
    }

    /// Same detector with initial settings.
    pub fn with_settings(mut self, settings: CameraSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Queries the camera and caches its description.
    ///
    /// `stage` queries again, so limits and sensor size are always current for a session.
    pub async fn connect(&mut self) -> AppResult<&CameraInfo> {
        let info = self.camera.describe().await?;
        info!(
            detector = %self.name,
            model = %info.model,
            serial = %info.serial,
            width = info.width,
            height = info.height,
            "Camera connected"
        );
        Ok(&*self.info.insert(info))
    }

    /// Opens a session: creates the dataset file, opens and configures the camera and
    /// queues the resource document.
    ///
    /// On failure the detector stays idle, the camera is closed, and any file this call
    /// created is removed. An existing file is never touched.
    pub async fn stage(&mut self) -> AppResult<()> {
        self.require(DetectorState::Idle, "stage")?;
        self.open_session().await.map_err(DaqError::into_stage)
    }

    async fn open_session(&mut self) -> AppResult<()> {
        let info = self.connect().await?.clone();

        self.resolve_settings(&info)?;
        let settings = self.settings;
        let shape = info.frame_shape();
        let dtype = settings.pixel_format.dtype();

        let session_id = new_uid();
        let stem = self.config.file_stem.as_deref().unwrap_or(&session_id);
        let relative_path = session_relative_path(stem, self.config.store_options.format);
        let path = self.config.root_dir.join(&relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = FrameStore::create(&path, shape, dtype, self.config.store_options.clone())?;

        if let Err(e) = self.camera.open().await {
            discard_store(store);
            return Err(e);
        }

        if self.applied != Some(settings) {
            if let Err(e) = self.camera.configure(&settings).await {
                if let Err(close_err) = self.camera.close().await {
                    warn!(error = %close_err, "Camera close failed after configure error");
                }
                discard_store(store);
                return Err(e);
            }
            self.applied = Some(settings);
        } else {
            debug!(detector = %self.name, "Settings unchanged, skipping configure");
        }

        let kwargs = HashMap::from([
            ("dataset".to_string(), store.dataset_path().into()),
            ("dtype".to_string(), dtype.as_str().into()),
            ("shape".to_string(), serde_json::json!([shape.height, shape.width])),
        ]);
        let resource =
            self.composer
                .make_resource(&self.config.root_dir, relative_path, kwargs);
        self.cache.push_resource(resource.clone());

        info!(
            detector = %self.name,
            session = %session_id,
            path = %path.display(),
            shape = %shape,
            dtype = %dtype,
            "Staged"
        );
        self.session = Some(Session {
            id: session_id,
            store,
            resource,
            frame_counter: 0,
        });
        Ok(())
    }

    /// Clamps exposure into the camera's range and checks the pixel format.
    fn resolve_settings(&mut self, info: &CameraInfo) -> AppResult<()> {
        let (exposure, warning) = clamp_to_range(
            "exposure_ms",
            self.settings.exposure_ms,
            info.exposure_min_ms,
            info.exposure_max_ms,
        )?;
        if let Some(warning) = warning {
            warn!(detector = %self.name, %warning, "Configuration clamped");
            self.warnings.push(warning);
            self.settings.exposure_ms = exposure;
        }
        info.check_format(self.settings.pixel_format)
    }

    /// Grabs one frame, stores it and queues its datum.
    ///
    /// A failed grab or append leaves the session as it was; nothing is retried.
    pub async fn trigger(&mut self) -> AppResult<TriggerStatus> {
        self.require(DetectorState::Staged, "trigger")?;
        let timeout = self.config.grab_timeout;
        let timeout_ms = timeout.as_millis() as u64;

        let frame = match tokio::time::timeout(timeout, self.camera.grab_one(timeout)).await {
            Ok(result) => result?,
            Err(_) => return Err(DaqError::GrabTimeout { timeout_ms }),
        };

        let Some(session) = self.session.as_mut() else {
            return Err(DaqError::InvalidState {
                operation: "trigger",
                state: DetectorState::Idle.as_str(),
            });
        };
        let frame_index = session.store.append(&frame)?;
        debug_assert_eq!(frame_index, session.frame_counter);
        session.frame_counter = frame_index + 1;

        let datum = self.composer.make_datum(&session.resource, frame_index);
        let datum_id = datum.datum_id.clone();
        self.cache.push_datum(datum);

        let mean = frame.mean();
        self.last_reading = Some(Reading {
            datum_id: datum_id.clone(),
            mean,
            shape: frame.shape(),
            time_ns: now_ns(),
        });
        debug!(detector = %self.name, frame_index, mean, "Frame stored");

        Ok(TriggerStatus {
            frame_index,
            datum_id,
            mean,
        })
    }

    /// Closes the camera and the dataset file and ends the session.
    ///
    /// The detector is idle afterwards even if closing failed; the failures are returned
    /// together as `Unstage`.
    pub async fn unstage(&mut self) -> AppResult<SessionSummary> {
        self.require(DetectorState::Staged, "unstage")?;
        let Some(mut session) = self.session.take() else {
            return Err(self.invalid_state("unstage"));
        };

        let mut errors = Vec::new();
        if let Err(e) = self.camera.close().await {
            warn!(detector = %self.name, error = %e, "Camera close failed");
            errors.push(e);
        }
        if let Err(e) = session.store.close() {
            warn!(detector = %self.name, error = %e, "Frame store close failed");
            errors.push(e);
        }

        let summary = SessionSummary {
            session_id: session.id,
            path: session.store.path().to_path_buf(),
            frames: session.frame_counter,
        };
        info!(
            detector = %self.name,
            session = %summary.session_id,
            frames = summary.frames,
            "Unstaged"
        );
        if errors.is_empty() {
            Ok(summary)
        } else {
            Err(DaqError::Unstage(errors))
        }
    }

    /// Drains every pending asset document, oldest first.
    pub fn collect_documents(&self) -> Vec<AssetDocument> {
        self.cache.drain()
    }

    /// Data keys of the event stream this detector feeds.
    pub fn describe(&self) -> HashMap<String, DataKey> {
        let shape = self
            .info
            .as_ref()
            .map(|info| vec![info.height, info.width])
            .unwrap_or_default();
        HashMap::from([
            (
                format!("{}_image", self.name),
                DataKey::external_array(&self.name, shape),
            ),
            (format!("{}_mean", self.name), DataKey::scalar(&self.name, "counts")),
            (format!("{}_shape", self.name), DataKey::array(&self.name, vec![2])),
        ])
    }

    /// Values recorded by the last successful trigger.
    pub fn read(&self) -> Option<&Reading> {
        self.last_reading.as_ref()
    }

    /// Current settings as strings, keyed by `<name>_<setting>`.
    pub fn read_configuration(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                format!("{}_exposure_ms", self.name),
                self.settings.exposure_ms.to_string(),
            ),
            (
                format!("{}_pixel_format", self.name),
                self.settings.pixel_format.to_string(),
            ),
            (
                format!("{}_trigger_mode", self.name),
                self.settings.trigger_mode.to_string(),
            ),
        ])
    }

    /// Lifecycle state.
    pub fn state(&self) -> DetectorState {
        if self.session.is_some() {
            DetectorState::Staged
        } else {
            DetectorState::Idle
        }
    }

    /// Detector name, used as the data key prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current settings.
    pub fn settings(&self) -> &CameraSettings {
        &self.settings
    }

    /// Replaces the settings; only while idle.
    pub fn set_settings(&mut self, settings: CameraSettings) -> AppResult<()> {
        *self.settings_mut()? = settings;
        Ok(())
    }

    /// Mutable settings; only while idle.
    pub fn settings_mut(&mut self) -> AppResult<&mut CameraSettings> {
        self.require(DetectorState::Idle, "change settings")?;
        Ok(&mut self.settings)
    }

    /// Returns and clears the clamp warnings raised so far.
    pub fn take_warnings(&mut self) -> Vec<ConfigurationClampWarning> {
        std::mem::take(&mut self.warnings)
    }

    /// Cached camera description, once connected.
    pub fn camera_info(&self) -> Option<&CameraInfo> {
        self.info.as_ref()
    }

    /// Frames stored in the current session.
    pub fn frame_count(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.frame_counter)
    }

    /// Dataset file of the current session.
    pub fn session_path(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.store.path())
    }

    /// A handle to the document cache, sharing its queue.
    pub fn asset_cache(&self) -> AssetCache {
        self.cache.clone()
    }

    /// The wrapped camera.
    pub fn camera(&self) -> &C {
        &self.camera
    }

    /// The wrapped camera, mutably.
    pub fn camera_mut(&mut self) -> &mut C {
        &mut self.camera
    }

    fn require(&self, expected: DetectorState, operation: &'static str) -> AppResult<()> {
        if self.state() == expected {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }

    fn invalid_state(&self, operation: &'static str) -> DaqError {
        DaqError::InvalidState {
            operation,
            state: self.state().as_str(),
        }
    }
}

/// `YYYY/MM/DD/<stem>.<ext>`, dated in UTC, with the extension of `format`.
pub fn session_relative_path(stem: &str, format: StorageFormat) -> PathBuf {
    let date = chrono::Utc::now().format("%Y/%m/%d").to_string();
    PathBuf::from(date).join(format!("{stem}.{}", format.extension()))
}

fn discard_store(store: FrameStore) {
    let path = store.path().to_path_buf();
    if let Err(e) = store.discard() {
        warn!(path = %path.display(), error = %e, "Could not remove dataset after failed stage");
    }
}
