//! Configuration module for camerascalib.

mod session;

pub use session::{
    CaptureBackend, Channel, ConfigError, MatchMode, SessionConfig, DEFAULT_FPS, DEFAULT_HEIGHT,
    DEFAULT_OUTPUT, DEFAULT_WIDTH, MAX_DIMENSION, MAX_FPS,
};
