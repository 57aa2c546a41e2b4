//! Capture module: frame sources for the two cameras of the rig.

mod gst;
mod pipeline;
mod source;

pub use gst::{GstCapture, GstOpener};
pub use pipeline::{capture_pipeline, launch_args, GST_LAUNCH};
pub use source::{decode_frame, CaptureError, CaptureOpener, FramePair, FrameSource};
