//! Run-time commands and the shared stop flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A command issued by a single key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `c`: estimate the transform from the accumulated data.
    Estimate,
    /// `s`: persist the current transform.
    Save,
    /// `r`: discard all calibration state.
    Reset,
    /// `q`: end the session after the current iteration.
    Quit,
}

impl Command {
    /// Look up a key; keys are case-sensitive and unknown keys map to `None`.
    pub fn from_key(key: char) -> Option<Self> {
        match key {
            'c' => Some(Command::Estimate),
            's' => Some(Command::Save),
            'r' => Some(Command::Reset),
            'q' => Some(Command::Quit),
            _ => None,
        }
    }

    pub fn key(&self) -> char {
        match self {
            Command::Estimate => 'c',
            Command::Save => 's',
            Command::Reset => 'r',
            Command::Quit => 'q',
        }
    }
}

/// Session-wide stop request.
///
/// Clones share one flag. Once raised it stays raised.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
