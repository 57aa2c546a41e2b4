//! Presentation sinks: where the match overlay and the stitched preview go,
//! and where run-time keys come from.

mod headless;
#[cfg(feature = "window")]
mod window;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::QualitySnapshot;

pub use headless::HeadlessSink;
#[cfg(feature = "window")]
pub use window::WindowSink;

/// Default number of presented frames between preview snapshots.
pub const DEFAULT_PREVIEW_EVERY: u32 = 15;

/// Display errors.
#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("Preview mode '{0}' is not available in this build")]
    Unsupported(PreviewMode),
    #[error("Window error: {0}")]
    Window(String),
    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How previews are shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewMode {
    /// Snapshots written to disk, keys read from stdin.
    #[default]
    Headless,
    /// Two live windows.
    Window,
}

impl FromStr for PreviewMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "headless" | "none" => Ok(PreviewMode::Headless),
            "window" | "gui" => Ok(PreviewMode::Window),
            other => Err(ConfigError::UnknownPreview(other.to_string())),
        }
    }
}

impl fmt::Display for PreviewMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreviewMode::Headless => write!(f, "headless"),
            PreviewMode::Window => write!(f, "window"),
        }
    }
}

/// Sink construction options.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayOptions {
    pub mode: PreviewMode,
    /// Parent directory of per-session snapshot folders (headless mode).
    pub preview_dir: PathBuf,
    /// Write snapshots every N presented frames; 0 disables them.
    pub every: u32,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            mode: PreviewMode::Headless,
            preview_dir: PathBuf::from("previews"),
            every: DEFAULT_PREVIEW_EVERY,
        }
    }
}

/// Shows the two preview streams and yields run-time keys.
#[allow(async_fn_in_trait)]
pub trait PresentationSink {
    /// Show the match overlay, the stitched preview and its quality.
    fn present(
        &mut self,
        matches: &RgbImage,
        stitched: &RgbImage,
        quality: &QualitySnapshot,
    ) -> Result<(), DisplayError>;

    /// Wait at most `wait` for one pressed key.
    async fn poll_key(&mut self, wait: Duration) -> Option<char>;
}

/// The sink selected at start-up.
pub enum PreviewSink {
    Headless(HeadlessSink),
    #[cfg(feature = "window")]
    Window(WindowSink),
}

impl PreviewSink {
    /// Open the sink described by `options`.
    pub fn open(options: &DisplayOptions) -> Result<Self, DisplayError> {
        match options.mode {
            PreviewMode::Headless => Ok(PreviewSink::Headless(HeadlessSink::new(
                &options.preview_dir,
                options.every,
            )?)),
            #[cfg(feature = "window")]
            PreviewMode::Window => Ok(PreviewSink::Window(WindowSink::new()?)),
            #[cfg(not(feature = "window"))]
            PreviewMode::Window => Err(DisplayError::Unsupported(PreviewMode::Window)),
        }
    }
}

impl PresentationSink for PreviewSink {
    fn present(
        &mut self,
        matches: &RgbImage,
        stitched: &RgbImage,
        quality: &QualitySnapshot,
    ) -> Result<(), DisplayError> {
        match self {
            PreviewSink::Headless(sink) => sink.present(matches, stitched, quality),
            #[cfg(feature = "window")]
            PreviewSink::Window(sink) => sink.present(matches, stitched, quality),
        }
    }

    async fn poll_key(&mut self, wait: Duration) -> Option<char> {
        match self {
            PreviewSink::Headless(sink) => sink.poll_key(wait).await,
            #[cfg(feature = "window")]
            PreviewSink::Window(sink) => sink.poll_key(wait).await,
        }
    }
}

/// One-line quality summary used in logs and window titles.
pub fn format_quality(quality: &QualitySnapshot) -> String {
    if !quality.is_measured() {
        return "not calibrated".to_string();
    }
    format!(
        "PSNR {:.2} dB, MSSIM R {:.3} G {:.3} B {:.3}",
        quality.psnr, quality.mssim[0], quality.mssim[1], quality.mssim[2]
    )
}
