//! Calibration controller: owns the session and turns keys into engine verbs.

mod command;
mod runner;

pub use command::{Command, StopFlag};
pub use runner::{
    Controller, LoopOptions, SessionSummary, StopReason, DEFAULT_KEY_WAIT, DEFAULT_RETRY_WAIT,
};
