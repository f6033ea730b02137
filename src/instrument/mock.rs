//! An emulated camera that generates synthetic frames.
//!
//! `MockCamera` mimics a vendor camera emulator: a 1024 × 1040 monochrome sensor whose
//! frames show a slowly wandering Gaussian beam. Frames are deterministic for a given seed.
//!
//! Tests can script the next grabs with [`MockGrab`] entries to inject explicit frames,
//! immediate timeouts or stalls, and can make `open`/`close` fail.
use crate::core::{Frame, FrameShape, PixelBuffer};
use crate::error::{AppResult, DaqError};
use crate::instrument::camera::{Camera, CameraInfo, CameraSettings, PixelFormat};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

/// Scripted outcome for one `grab_one` call.
#[derive(Debug, Clone)]
pub enum MockGrab {
    /// Deliver this frame as-is (its shape is not checked).
    Frame(Frame),
    /// Fail immediately with `GrabTimeout`.
    Timeout,
    /// Sleep for the duration, then fail with `GrabTimeout`.
    Stall(Duration),
}

/// Parameters of the synthetic beam: amplitude, center and spread.
#[derive(Debug, Clone, Copy)]
struct Beam {
    amplitude: f64,
    cx: f64,
    cy: f64,
    sx: f64,
    sy: f64,
}

/// Random-walk generator for the wandering Gaussian beam.
#[derive(Debug)]
struct WanderingBeam {
    rng: StdRng,
    beam: Beam,
}

impl WanderingBeam {
    fn new(seed: u64, shape: FrameShape) -> Self {
        let (w, h) = (shape.width as f64, shape.height as f64);
        Self {
            rng: StdRng::seed_from_u64(seed),
            beam: Beam {
                amplitude: 0.75,
                cx: w / 2.0,
                cy: h / 2.0,
                sx: w / 16.0,
                sy: h / 16.0,
            },
        }
    }

    fn step(&mut self, shape: FrameShape) {
        let (w, h) = (shape.width as f64, shape.height as f64);
        let b = &mut self.beam;
        b.amplitude = (b.amplitude + self.rng.gen_range(-0.05..0.05)).clamp(0.25, 1.0);
        b.cx = (b.cx + self.rng.gen_range(-1.0..1.0) * w / 64.0).clamp(0.0, w);
        b.cy = (b.cy + self.rng.gen_range(-1.0..1.0) * h / 64.0).clamp(0.0, h);
        b.sx = (b.sx + self.rng.gen_range(-1.0..1.0) * w / 256.0).clamp(w / 64.0, w / 8.0);
        b.sy = (b.sy + self.rng.gen_range(-1.0..1.0) * h / 256.0).clamp(h / 64.0, h / 8.0);
    }

    /// Renders the current beam as normalized intensities in `[0, 1]`.
    fn render(&self, shape: FrameShape) -> Vec<f64> {
        let b = self.beam;
        let mut out = Vec::with_capacity(shape.pixels());
        for y in 0..shape.height {
            let dy = (y as f64 - b.cy) / b.sy;
            for x in 0..shape.width {
                let dx = (x as f64 - b.cx) / b.sx;
                out.push(b.amplitude * (-0.5 * (dx * dx + dy * dy)).exp());
            }
        }
        out
    }
}

/// Emulated camera implementing the [`Camera`] contract.
#[derive(Debug)]
pub struct MockCamera {
    info: CameraInfo,
    open: bool,
    applied: Option<CameraSettings>,
    configure_calls: usize,
    open_calls: usize,
    open_failure: Option<String>,
    close_failure: Option<String>,
    describe_failure: Option<String>,
    script: VecDeque<MockGrab>,
    beam: WanderingBeam,
    frames_grabbed: u64,
    history: Option<Vec<Frame>>,
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::emulated()
    }
}

impl MockCamera {
    /// Camera with the emulator's default 1024 × 1040 sensor.
    pub fn emulated() -> Self {
        Self::new(1024, 1040)
    }

    /// Camera with a `width` × `height` sensor.
    pub fn new(width: u32, height: u32) -> Self {
        let info = CameraInfo {
            model: "Emulation".to_string(),
            serial: "0815-0000".to_string(),
            user_defined_name: "emulated".to_string(),
            width,
            height,
            pixel_min: 0,
            pixel_max: PixelFormat::Mono8.max_value(),
            exposure_min_ms: 0.02,
            exposure_max_ms: 1_000.0,
            active_format: PixelFormat::Mono8,
            supported_formats: vec![
                PixelFormat::Mono8,
                PixelFormat::Mono10,
                PixelFormat::Mono12,
                PixelFormat::Mono16,
            ],
            payload_size: width as u64 * height as u64,
        };
        let shape = info.frame_shape();
        Self {
            info,
            open: false,
            applied: None,
            configure_calls: 0,
            open_calls: 0,
            open_failure: None,
            close_failure: None,
            describe_failure: None,
            script: VecDeque::new(),
            beam: WanderingBeam::new(0, shape),
            frames_grabbed: 0,
            history: None,
        }
    }

    /// Reseeds the beam generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.beam = WanderingBeam::new(seed, self.info.frame_shape());
        self
    }

    /// Overrides the advertised exposure range.
    pub fn with_exposure_range(mut self, min_ms: f64, max_ms: f64) -> Self {
        self.info.exposure_min_ms = min_ms;
        self.info.exposure_max_ms = max_ms;
        self
    }

    /// Overrides the advertised pixel formats.
    pub fn with_supported_formats(mut self, formats: Vec<PixelFormat>) -> Self {
        self.info.supported_formats = formats;
        self
    }

    /// Keeps a copy of every delivered frame, see [`MockCamera::history`].
    pub fn recording(mut self) -> Self {
        self.history = Some(Vec::new());
        self
    }

    /// Changes the sensor region, as another client of the device might between sessions.
    pub fn set_sensor_size(&mut self, width: u32, height: u32) {
        self.info.width = width;
        self.info.height = height;
        self.info.payload_size = width as u64 * height as u64;
    }

    /// Makes subsequent `open` calls fail with `CameraOpen`.
    pub fn fail_open(&mut self, reason: &str) {
        self.open_failure = Some(reason.to_string());
    }

    /// Makes subsequent `close` calls fail (the camera still ends up closed).
    pub fn fail_close(&mut self, reason: &str) {
        self.close_failure = Some(reason.to_string());
    }

    /// Makes subsequent `describe` calls fail.
    pub fn fail_describe(&mut self, reason: &str) {
        self.describe_failure = Some(reason.to_string());
    }

    /// Clears all injected failures.
    pub fn clear_failures(&mut self) {
        self.open_failure = None;
        self.close_failure = None;
        self.describe_failure = None;
    }

    /// Queues a scripted grab outcome.
    pub fn push_grab(&mut self, grab: MockGrab) {
        self.script.push_back(grab);
    }

    /// Queues an explicit frame.
    pub fn push_frame(&mut self, frame: Frame) {
        self.push_grab(MockGrab::Frame(frame));
    }

    /// Queues an immediate grab timeout.
    pub fn push_timeout(&mut self) {
        self.push_grab(MockGrab::Timeout);
    }

    /// Settings last applied through `configure`.
    pub fn applied_settings(&self) -> Option<&CameraSettings> {
        self.applied.as_ref()
    }

    /// Number of `configure` calls that reached the device.
    pub fn configure_calls(&self) -> usize {
        self.configure_calls
    }

    /// Number of `open` attempts.
    pub fn open_calls(&self) -> usize {
        self.open_calls
    }

    /// Frames delivered so far.
    pub fn frames_grabbed(&self) -> u64 {
        self.frames_grabbed
    }

    /// Delivered frames, when recording is enabled.
    pub fn history(&self) -> &[Frame] {
        self.history.as_deref().unwrap_or(&[])
    }

    fn synthesize(&mut self) -> AppResult<Frame> {
        let shape = self.info.frame_shape();
        self.beam.step(shape);
        let intensities = self.beam.render(shape);
        let format = self
            .applied
            .map(|s| s.pixel_format)
            .unwrap_or(self.info.active_format);
        let max = format.max_value() as f64;
        let pixels = match format {
            PixelFormat::Mono8 => {
                PixelBuffer::U8(intensities.iter().map(|v| (v * max).round() as u8).collect())
            }
            _ => PixelBuffer::U16(
                intensities
                    .iter()
                    .map(|v| (v * max).round() as u16)
                    .collect(),
            ),
        };
        Frame::new(shape, pixels)
    }
}

#[async_trait]
impl Camera for MockCamera {
    async fn describe(&mut self) -> AppResult<CameraInfo> {
        if let Some(reason) = &self.describe_failure {
            return Err(DaqError::Camera(reason.clone()));
        }
        Ok(self.info.clone())
    }

    async fn open(&mut self) -> AppResult<()> {
        self.open_calls += 1;
        if let Some(reason) = &self.open_failure {
            return Err(DaqError::CameraOpen(reason.clone()));
        }
        info!(model = %self.info.model, serial = %self.info.serial, "Opening emulated camera");
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        let was_open = std::mem::replace(&mut self.open, false);
        if let Some(reason) = &self.close_failure {
            return Err(DaqError::Camera(reason.clone()));
        }
        if was_open {
            info!("Closing emulated camera");
        }
        Ok(())
    }

    async fn configure(&mut self, settings: &CameraSettings) -> AppResult<()> {
        self.info.check_format(settings.pixel_format)?;
        debug!(
            exposure_ms = settings.exposure_ms,
            pixel_format = %settings.pixel_format,
            trigger_mode = %settings.trigger_mode,
            "Configuring emulated camera"
        );
        self.configure_calls += 1;
        self.info.active_format = settings.pixel_format;
        self.info.pixel_max = settings.pixel_format.max_value();
        self.applied = Some(*settings);
        Ok(())
    }

    async fn grab_one(&mut self, timeout: Duration) -> AppResult<Frame> {
        if !self.open {
            return Err(DaqError::Camera("grab requested on a closed camera".into()));
        }
        let timeout_ms = timeout.as_millis() as u64;
        let frame = match self.script.pop_front() {
            Some(MockGrab::Frame(frame)) => frame,
            Some(MockGrab::Timeout) => return Err(DaqError::GrabTimeout { timeout_ms }),
            Some(MockGrab::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                return Err(DaqError::GrabTimeout { timeout_ms });
            }
            None => self.synthesize()?,
        };
        self.frames_grabbed += 1;
        if let Some(history) = self.history.as_mut() {
            history.push(frame.clone());
        }
        Ok(frame)
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
