//! Session configuration shared by the capture, engine and controller layers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default capture width in pixels.
pub const DEFAULT_WIDTH: u32 = 1920;

/// Default capture height in pixels.
pub const DEFAULT_HEIGHT: u32 = 1080;

/// Default capture rate in frames per second.
pub const DEFAULT_FPS: u32 = 30;

/// Default output file for the calibrated transform.
pub const DEFAULT_OUTPUT: &str = "cameras.xml";

/// Largest capture dimension accepted by validation.
pub const MAX_DIMENSION: u32 = 8192;

/// Largest capture rate accepted by validation.
pub const MAX_FPS: u32 = 240;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid image size {width}x{height} (each side must be 1..=8192)")]
    InvalidImageSize { width: u32, height: u32 },
    #[error("Invalid frame rate {0} (must be 1..=240)")]
    InvalidFps(u32),
    #[error("Output path must not be empty")]
    EmptyOutput,
    #[error("Both cameras use sensor {0}")]
    DuplicateSensor(u32),
    #[error("Unknown match mode: {0}")]
    UnknownMatchMode(String),
    #[error("Unknown capture source: {0}")]
    UnknownSource(String),
    #[error("Unknown preview mode: {0}")]
    UnknownPreview(String),
    #[error("Settings error: {0}")]
    Settings(String),
}

/// Feature detector used by the calibration engine.
///
/// The numeric selector mirrors the `--match-mode` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// FAST-9 corners.
    #[default]
    Fast9,
    /// FAST-12 corners; fewer, more stable features.
    Fast12,
}

impl MatchMode {
    /// Numeric selector of this mode.
    pub fn selector(&self) -> u8 {
        match self {
            MatchMode::Fast9 => 0,
            MatchMode::Fast12 => 1,
        }
    }
}

impl FromStr for MatchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "0" | "fast9" => Ok(MatchMode::Fast9),
            "1" | "fast12" => Ok(MatchMode::Fast12),
            other => Err(ConfigError::UnknownMatchMode(other.to_string())),
        }
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchMode::Fast9 => write!(f, "fast9"),
            MatchMode::Fast12 => write!(f, "fast12"),
        }
    }
}

/// Where frames come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    /// CSI cameras through `nvarguscamerasrc` (Jetson).
    #[default]
    Argus,
    /// USB/V4L2 cameras, `/dev/video<sensor>`.
    V4l2,
    /// Synthetic `videotestsrc` streams.
    Test,
}

impl FromStr for CaptureBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "argus" | "csi" => Ok(CaptureBackend::Argus),
            "v4l2" | "usb" => Ok(CaptureBackend::V4l2),
            "test" => Ok(CaptureBackend::Test),
            other => Err(ConfigError::UnknownSource(other.to_string())),
        }
    }
}

impl fmt::Display for CaptureBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureBackend::Argus => write!(f, "argus"),
            CaptureBackend::V4l2 => write!(f, "v4l2"),
            CaptureBackend::Test => write!(f, "test"),
        }
    }
}

/// One of the two capture channels of the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    First,
    Second,
}

impl Channel {
    /// Index into per-channel arrays.
    pub fn index(&self) -> usize {
        match self {
            Channel::First => 0,
            Channel::Second => 1,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::First => write!(f, "first"),
            Channel::Second => write!(f, "second"),
        }
    }
}

/// Immutable configuration of one calibration session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Capture width, also the engine's expected frame width.
    pub width: u32,
    /// Capture height, also the engine's expected frame height.
    pub height: u32,
    /// Capture rate requested from the sources.
    pub fps: u32,
    /// Where `save` writes the transform.
    pub output: PathBuf,
    /// Feature detector selector.
    pub match_mode: MatchMode,
    /// Capture backend for both channels.
    pub backend: CaptureBackend,
    /// Sensor ids of the first and second camera.
    pub sensors: [u32; 2],
    /// Longest wait for one frame during the loop.
    pub frame_timeout: Duration,
    /// Longest wait for the first frame when a channel is opened.
    pub open_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            output: PathBuf::from(DEFAULT_OUTPUT),
            match_mode: MatchMode::default(),
            backend: CaptureBackend::default(),
            sensors: [0, 1],
            frame_timeout: Duration::from_millis(500),
            open_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Set the capture size.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the capture rate.
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    /// Set the output path.
    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_match_mode(mut self, match_mode: MatchMode) -> Self {
        self.match_mode = match_mode;
        self
    }

    pub fn with_backend(mut self, backend: CaptureBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_sensors(mut self, first: u32, second: u32) -> Self {
        self.sensors = [first, second];
        self
    }

    /// Sensor id of a channel.
    pub fn sensor(&self, channel: Channel) -> u32 {
        self.sensors[channel.index()]
    }

    /// Check the configuration before any resource is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_side = |v: u32| (1..=MAX_DIMENSION).contains(&v);
        if !valid_side(self.width) || !valid_side(self.height) {
            return Err(ConfigError::InvalidImageSize {
                width: self.width,
                height: self.height,
            });
        }

        if !(1..=MAX_FPS).contains(&self.fps) {
            return Err(ConfigError::InvalidFps(self.fps));
        }

        if self.output.as_os_str().is_empty() {
            return Err(ConfigError::EmptyOutput);
        }

        if self.sensors[0] == self.sensors[1] && self.backend != CaptureBackend::Test {
            return Err(ConfigError::DuplicateSensor(self.sensors[0]));
        }

        Ok(())
    }
}
