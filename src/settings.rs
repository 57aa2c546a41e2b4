//! Persisted rig settings.
//! Stored in the platform-specific config directory via `directories::ProjectDirs`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{
    CaptureBackend, ConfigError, MatchMode, SessionConfig, DEFAULT_FPS, DEFAULT_HEIGHT,
    DEFAULT_OUTPUT, DEFAULT_WIDTH,
};
use crate::display::{DisplayOptions, PreviewMode, DEFAULT_PREVIEW_EVERY};

/// Rig settings that can be saved and loaded.
///
/// Missing fields take their defaults, so older files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigSettings {
    /// Capture width in pixels
    pub width: u32,
    /// Capture height in pixels
    pub height: u32,
    /// Capture rate
    pub fps: u32,
    /// Transform output file
    pub output: PathBuf,
    pub match_mode: MatchMode,
    pub source: CaptureBackend,
    /// Sensor ids of the first and second camera
    pub sensors: [u32; 2],
    pub preview: PreviewMode,
    /// Headless snapshot directory
    pub preview_dir: PathBuf,
    /// Headless snapshot interval in frames
    pub preview_every: u32,
}

impl Default for RigSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            output: PathBuf::from(DEFAULT_OUTPUT),
            match_mode: MatchMode::Fast9,
            source: CaptureBackend::Argus,
            sensors: [0, 1],
            preview: PreviewMode::Headless,
            preview_dir: Self::default_preview_dir(),
            preview_every: DEFAULT_PREVIEW_EVERY,
        }
    }
}

/// Values given on the command line or in the environment.
///
/// `None` leaves the stored setting in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub output: Option<PathBuf>,
    pub match_mode: Option<MatchMode>,
    pub source: Option<CaptureBackend>,
    pub sensors: Option<[u32; 2]>,
    pub preview: Option<PreviewMode>,
    pub preview_dir: Option<PathBuf>,
    pub preview_every: Option<u32>,
}

impl RigSettings {
    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "camerascalib", "camerascalib")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the settings file path.
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("settings.json"))
    }

    /// Default parent of headless preview folders.
    pub fn default_preview_dir() -> PathBuf {
        directories::ProjectDirs::from("org", "camerascalib", "camerascalib")
            .map(|dirs| dirs.data_dir().join("previews"))
            .unwrap_or_else(|| PathBuf::from("previews"))
    }

    /// Load settings from the config file, falling back to defaults.
    pub fn load() -> Self {
        Self::settings_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default()
    }

    /// Load settings from `path`; unreadable or invalid files give defaults.
    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring invalid settings file {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save settings to the config file.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::settings_path()
            .ok_or_else(|| ConfigError::Settings("Cannot determine config directory".into()))?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save settings to `path`, creating its directory.
    ///
    /// Settings that would not start a session are refused.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        self.session_config().validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                ConfigError::Settings(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Settings(format!("Failed to serialize settings: {}", e)))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::Settings(format!("Failed to write settings file: {}", e)))?;

        Ok(())
    }

    /// Apply command-line and environment values on top of these settings.
    pub fn merge(mut self, overrides: SettingsOverrides) -> Self {
        let SettingsOverrides {
            width,
            height,
            fps,
            output,
            match_mode,
            source,
            sensors,
            preview,
            preview_dir,
            preview_every,
        } = overrides;

        self.width = width.unwrap_or(self.width);
        self.height = height.unwrap_or(self.height);
        self.fps = fps.unwrap_or(self.fps);
        self.output = output.unwrap_or(self.output);
        self.match_mode = match_mode.unwrap_or(self.match_mode);
        self.source = source.unwrap_or(self.source);
        self.sensors = sensors.unwrap_or(self.sensors);
        self.preview = preview.unwrap_or(self.preview);
        self.preview_dir = preview_dir.unwrap_or(self.preview_dir);
        self.preview_every = preview_every.unwrap_or(self.preview_every);
        self
    }

    /// Session configuration described by these settings.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::default()
            .with_size(self.width, self.height)
            .with_fps(self.fps)
            .with_output(self.output.clone())
            .with_match_mode(self.match_mode)
            .with_backend(self.source)
            .with_sensors(self.sensors[0], self.sensors[1])
    }

    /// Preview sink options described by these settings.
    pub fn display_options(&self) -> DisplayOptions {
        DisplayOptions {
            mode: self.preview,
            preview_dir: self.preview_dir.clone(),
            every: self.preview_every,
        }
    }
}

/// Parse a `first,second` sensor list.
pub fn parse_sensors(s: &str) -> Result<[u32; 2], ConfigError> {
    let invalid = || ConfigError::Settings(format!("Invalid sensor list '{}'", s));
    let mut ids = s.split(',').map(|part| part.trim().parse::<u32>());
    match (ids.next(), ids.next(), ids.next()) {
        (Some(Ok(first)), Some(Ok(second)), None) => Ok([first, second]),
        _ => Err(invalid()),
    }
}
