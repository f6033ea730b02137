//! basler_daq - acquire frames from an emulated camera and inspect session files.
//!
//! `acquire` runs a count plan: stage, N triggers, unstage. Every asset document is
//! printed to stdout as one JSON line as soon as it is queued, so the output can be piped
//! straight into a document consumer. Logs go to stderr.

use anyhow::{bail, Context, Result};
use basler_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use basler_daq::data::FrameStore;
use basler_daq::instrument::MockCamera;
use basler_daq::logging::{self, LogFormat};
use basler_daq::CameraDetector;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "basler_daq",
    about = "Staged camera acquisition into append-only frame files"
)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stage, trigger N times and unstage, printing asset documents as JSON lines
    Acquire {
        /// Number of frames
        #[arg(long, short = 'n', default_value_t = 1)]
        frames: u64,

        /// Override the storage root directory
        #[arg(long, value_name = "DIR")]
        root: Option<PathBuf>,

        /// Override the exposure time
        #[arg(long, value_name = "MS")]
        exposure_ms: Option<f64>,

        /// Emulated sensor width
        #[arg(long, default_value_t = 1024)]
        width: u32,

        /// Emulated sensor height
        #[arg(long, default_value_t = 1040)]
        height: u32,

        /// Seed of the emulated beam
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Print the header of a session file and statistics of one frame
    Inspect {
        /// Session file (.frm or .h5)
        file: PathBuf,

        /// Frame to summarize
        #[arg(long, default_value_t = 0)]
        index: u64,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    logging::init(&settings.application.log_level, format);

    match cli.command {
        Command::Acquire {
            frames,
            root,
            exposure_ms,
            width,
            height,
            seed,
        } => {
            let camera = MockCamera::new(width, height).with_seed(seed);
            acquire(settings, camera, frames, root, exposure_ms).await
        }
        Command::Inspect { file, index } => inspect(&file, index),
        Command::ShowConfig => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

async fn acquire(
    mut settings: Settings,
    camera: MockCamera,
    frames: u64,
    root: Option<PathBuf>,
    exposure_ms: Option<f64>,
) -> Result<()> {
    if let Some(root) = root {
        settings.storage.root_dir = root;
    }
    if let Some(exposure_ms) = exposure_ms {
        settings.camera.exposure_ms = exposure_ms;
    }
    settings.validate()?;

    let mut detector = CameraDetector::new(
        settings.application.name.clone(),
        camera,
        settings.detector_config(),
    )
    .with_settings(settings.camera_settings());

    let mut out = std::io::stdout();

    detector.stage().await.context("stage failed")?;
    for warning in detector.take_warnings() {
        eprintln!("warning: {warning}");
    }
    emit(&mut out, &detector)?;

    let mut failures = 0u64;
    for _ in 0..frames {
        match detector.trigger().await {
            Ok(status) => {
                info!(frame_index = status.frame_index, mean = status.mean, "Triggered");
            }
            Err(e) => {
                failures += 1;
                eprintln!("trigger failed: {e}");
            }
        }
        emit(&mut out, &detector)?;
    }

    let summary = detector.unstage().await.context("unstage failed")?;
    emit(&mut out, &detector)?;
    info!(
        session = %summary.session_id,
        path = %summary.path.display(),
        frames = summary.frames,
        "Session closed"
    );

    if failures > 0 {
        bail!("{failures} of {frames} triggers failed");
    }
    Ok(())
}

fn emit(out: &mut impl Write, detector: &CameraDetector<MockCamera>) -> Result<()> {
    for document in detector.collect_documents() {
        serde_json::to_writer(&mut *out, &document)?;
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

fn inspect(file: &Path, index: u64) -> Result<()> {
    let mut store = FrameStore::open(file)
        .with_context(|| format!("opening {}", file.display()))?;
    println!("file:        {}", store.path().display());
    println!("format:      {:?}", store.format());
    println!("dataset:     {}", store.dataset_path());
    let shape = store.shape();
    println!("shape:       ({}, {}, {})", store.len(), shape.height, shape.width);
    println!("dtype:       {}", store.dtype());
    println!("compression: {:?}", store.compression());

    if store.is_empty() {
        println!("no frames");
        return Ok(());
    }
    let frame = store.read(index)?;
    let samples = frame.pixels().as_f64();
    let (min, max) = samples
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    println!("frame {index}: mean {:.3}, min {min}, max {max}", frame.mean());
    store.close()?;
    Ok(())
}
