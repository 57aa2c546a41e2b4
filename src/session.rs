//! Start-up wiring: opens the session resources in order and classifies
//! fatal failures.

use thiserror::Error;
use tracing::info;

use crate::capture::{CaptureError, CaptureOpener};
use crate::config::{Channel, ConfigError, SessionConfig};
use crate::controller::{Controller, LoopOptions, StopFlag};
use crate::display::{DisplayError, PresentationSink};
use crate::engine::{CalibrationEngine, EngineError};

/// Process exit statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal quit, interrupt, or help output.
    Success,
    /// Unexpected failure.
    Failure,
    InvalidConfig,
    FirstCamera,
    SecondCamera,
    Engine,
    Display,
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
            ExitStatus::InvalidConfig => 2,
            ExitStatus::FirstCamera => 3,
            ExitStatus::SecondCamera => 4,
            ExitStatus::Engine => 5,
            ExitStatus::Display => 6,
        }
    }
}

/// Fatal start-up errors.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("{0}")]
    FirstCapture(#[source] CaptureError),
    #[error("{0}")]
    SecondCapture(#[source] CaptureError),
    #[error("Failed to create calibration engine: {0}")]
    Engine(#[from] EngineError),
    #[error("Failed to open preview: {0}")]
    Display(#[from] DisplayError),
}

impl StartupError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            StartupError::InvalidConfig(_) => ExitStatus::InvalidConfig,
            StartupError::FirstCapture(_) => ExitStatus::FirstCamera,
            StartupError::SecondCapture(_) => ExitStatus::SecondCamera,
            StartupError::Engine(_) => ExitStatus::Engine,
            StartupError::Display(_) => ExitStatus::Display,
        }
    }
}

/// Validate the configuration, open both cameras, build the engine and the
/// sink, and hand everything to a controller.
///
/// Anything already opened is released when a later step fails.
pub async fn launch<O, E, P, F>(
    config: &SessionConfig,
    opener: &O,
    open_sink: F,
    stop: StopFlag,
) -> Result<Controller<O::Source, E, P>, StartupError>
where
    O: CaptureOpener,
    E: CalibrationEngine,
    P: PresentationSink,
    F: FnOnce() -> Result<P, DisplayError>,
{
    config.validate()?;
    info!(
        "Starting session: {}x{}@{} from {}, output {}",
        config.width,
        config.height,
        config.fps,
        config.backend,
        config.output.display()
    );

    let first = opener
        .open(config, Channel::First)
        .await
        .map_err(StartupError::FirstCapture)?;
    let second = opener
        .open(config, Channel::Second)
        .await
        .map_err(StartupError::SecondCapture)?;
    let engine = E::build(config)?;
    let sink = open_sink()?;

    let options = LoopOptions {
        retry_wait: config.frame_timeout,
        ..LoopOptions::default()
    };
    Ok(Controller::new(first, second, engine, sink, stop).with_options(options))
}
