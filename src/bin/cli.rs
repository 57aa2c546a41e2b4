//! camerascalib - interactive two-camera stitching calibration
//!
//! This is the CLI entry point.
//! Run with: cargo run --bin camerascalib -- --source test

use camerascalib::capture::GstOpener;
use camerascalib::config::{CaptureBackend, MatchMode};
use camerascalib::controller::StopFlag;
use camerascalib::display::{PreviewMode, PreviewSink};
use camerascalib::engine::StitchEngine;
use camerascalib::session::{launch, ExitStatus};
use camerascalib::settings::{parse_sensors, RigSettings, SettingsOverrides};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Calibrate the homography between two cameras and preview the stitch.
///
/// Keys while running: c = estimate, s = save, r = reset, q = quit.
#[derive(Parser, Debug)]
#[command(name = "camerascalib", version, about, long_about = None)]
struct Cli {
    /// Capture width in pixels [default: 1920]
    #[arg(long, env = "CAMERASCALIB_WIDTH")]
    width: Option<u32>,

    /// Capture height in pixels [default: 1080]
    #[arg(long, env = "CAMERASCALIB_HEIGHT")]
    height: Option<u32>,

    /// Capture frame rate [default: 30]
    #[arg(long, env = "CAMERASCALIB_FPS")]
    fps: Option<u32>,

    /// Transform output file; .json for JSON, anything else for OpenCV XML [default: cameras.xml]
    #[arg(long, env = "CAMERASCALIB_OUT")]
    out: Option<PathBuf>,

    /// Feature detector: 0 = FAST-9, 1 = FAST-12 [default: 0]
    #[arg(long, env = "CAMERASCALIB_MATCH_MODE")]
    match_mode: Option<MatchMode>,

    /// Capture source: argus, v4l2 or test [default: argus]
    #[arg(long, env = "CAMERASCALIB_SOURCE")]
    source: Option<CaptureBackend>,

    /// Sensor ids of the first and second camera [default: 0,1]
    #[arg(long, env = "CAMERASCALIB_SENSORS", value_parser = parse_sensors)]
    sensors: Option<[u32; 2]>,

    /// Preview: headless (snapshots + stdin keys) or window [default: headless]
    #[arg(long, env = "CAMERASCALIB_PREVIEW")]
    preview: Option<PreviewMode>,

    /// Directory for headless preview snapshots
    #[arg(long, env = "CAMERASCALIB_PREVIEW_DIR")]
    preview_dir: Option<PathBuf>,

    /// Write headless snapshots every N frames, 0 to disable [default: 15]
    #[arg(long, env = "CAMERASCALIB_PREVIEW_EVERY")]
    preview_every: Option<u32>,

    /// Store the effective options as the new defaults
    #[arg(long)]
    save_settings: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            width: self.width,
            height: self.height,
            fps: self.fps,
            output: self.out.clone(),
            match_mode: self.match_mode,
            source: self.source,
            sensors: self.sensors,
            preview: self.preview,
            preview_dir: self.preview_dir.clone(),
            preview_every: self.preview_every,
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> anyhow::Result<ExitStatus> {
    // Load .env file if present (ignore errors if file doesn't exist)
    let _ = dotenvy::dotenv();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version go to stdout and are not failures.
            let status = if e.use_stderr() {
                ExitStatus::InvalidConfig
            } else {
                ExitStatus::Success
            };
            e.print()?;
            return Ok(status);
        }
    };

    init_tracing(cli.verbose);

    let settings = RigSettings::load().merge(cli.overrides());
    if cli.save_settings {
        match settings.save() {
            Ok(path) => tracing::info!("Settings saved to {}", path.display()),
            Err(e) => tracing::warn!("Settings not saved: {}", e),
        }
    }

    let config = settings.session_config();
    let display = settings.display_options();

    let stop = StopFlag::new();
    let interrupt = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, stopping after the current iteration");
            interrupt.raise();
        }
    });

    let controller = match launch::<_, StitchEngine, _, _>(
        &config,
        &GstOpener,
        || PreviewSink::open(&display),
        stop,
    )
    .await
    {
        Ok(controller) => controller,
        Err(e) => {
            tracing::error!("{}", e);
            return Ok(e.exit_status());
        }
    };

    let summary = controller.run().await;
    tracing::info!("Session summary: {}", serde_json::to_string(&summary)?);

    Ok(ExitStatus::Success)
}

#[tokio::main]
async fn main() {
    let status = match run().await {
        Ok(status) => status,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitStatus::Failure
        }
    };
    std::process::exit(status.code());
}
