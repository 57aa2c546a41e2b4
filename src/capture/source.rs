//! Frame source abstraction and the frame pair handed to the engine.

use image::RgbImage;
use thiserror::Error;

use crate::config::{Channel, SessionConfig};

/// Capture errors.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to open {channel} camera ({pipeline}): {reason}")]
    Open {
        channel: Channel,
        pipeline: String,
        reason: String,
    },
    #[error("No frame within {0} ms")]
    Timeout(u64),
    #[error("Capture stream closed")]
    Closed,
    #[error("Malformed frame: expected {expected} bytes, got {actual}")]
    Malformed { expected: usize, actual: usize },
    #[error("Frame size mismatch: {first:?} vs {second:?}")]
    Mismatch { first: (u32, u32), second: (u32, u32) },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Two time-aligned frames, one per camera.
#[derive(Debug, Clone)]
pub struct FramePair {
    pub first: RgbImage,
    pub second: RgbImage,
}

impl FramePair {
    /// Pair two frames, rejecting frames of different sizes.
    pub fn new(first: RgbImage, second: RgbImage) -> Result<Self, CaptureError> {
        if first.dimensions() != second.dimensions() {
            return Err(CaptureError::Mismatch {
                first: first.dimensions(),
                second: second.dimensions(),
            });
        }
        Ok(Self { first, second })
    }

    /// Size shared by both frames.
    pub fn dimensions(&self) -> (u32, u32) {
        self.first.dimensions()
    }
}

/// A single capture channel producing RGB frames.
#[allow(async_fn_in_trait)]
pub trait FrameSource {
    /// Wait (bounded) for the next frame.
    async fn grab(&mut self) -> Result<RgbImage, CaptureError>;
}

/// Opens capture channels for a session.
#[allow(async_fn_in_trait)]
pub trait CaptureOpener {
    type Source: FrameSource;

    /// Open one channel; it must be producing frames when this returns.
    async fn open(
        &self,
        config: &SessionConfig,
        channel: Channel,
    ) -> Result<Self::Source, CaptureError>;
}

/// Turn one raw packed RGB buffer into an image.
pub fn decode_frame(buffer: Vec<u8>, width: u32, height: u32) -> Result<RgbImage, CaptureError> {
    let expected = width as usize * height as usize * 3;
    let actual = buffer.len();
    if actual != expected {
        return Err(CaptureError::Malformed { expected, actual });
    }
    RgbImage::from_raw(width, height, buffer).ok_or(CaptureError::Malformed { expected, actual })
}
