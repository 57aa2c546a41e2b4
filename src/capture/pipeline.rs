//! GStreamer pipeline descriptions for each capture backend.
//!
//! Every pipeline ends in raw packed RGB written to stdout, so one frame
//! is exactly `width * height * 3` bytes on the pipe.

use crate::config::{CaptureBackend, Channel, SessionConfig};

/// Program used to run capture pipelines.
pub const GST_LAUNCH: &str = "gst-launch-1.0";

/// Raw RGB sink shared by every backend.
const RGB_SINK: &str = "videoconvert ! video/x-raw, format=(string)RGB ! fdsink fd=1 sync=false";

/// Build the pipeline description for one channel.
pub fn capture_pipeline(config: &SessionConfig, channel: Channel) -> String {
    let sensor = config.sensor(channel);
    let (width, height, fps) = (config.width, config.height, config.fps);

    match config.backend {
        CaptureBackend::Argus => format!(
            "nvarguscamerasrc sensor-id={sensor} ! video/x-raw(memory:NVMM), width=(int){width}, \
             height=(int){height}, format=(string)NV12, framerate=(fraction){fps}/1 ! nvvidconv \
             ! video/x-raw, format=(string)BGRx ! {RGB_SINK}"
        ),
        CaptureBackend::V4l2 => format!(
            "v4l2src device=/dev/video{sensor} ! videoconvert ! videoscale ! videorate \
             ! video/x-raw, width=(int){width}, height=(int){height}, framerate=(fraction){fps}/1 \
             ! {RGB_SINK}"
        ),
        CaptureBackend::Test => {
            // Distinct patterns so the two test channels are distinguishable.
            let pattern = if channel == Channel::First { "smpte" } else { "ball" };
            format!(
                "videotestsrc is-live=true pattern={pattern} ! video/x-raw, width=(int){width}, \
                 height=(int){height}, framerate=(fraction){fps}/1 ! {RGB_SINK}"
            )
        }
    }
}

/// Split a pipeline description into `gst-launch-1.0` arguments.
///
/// `gst-launch-1.0` re-joins its arguments with spaces before parsing, so
/// whitespace splitting keeps caps such as `video/x-raw(memory:NVMM),`
/// intact without a shell.
pub fn launch_args(pipeline: &str) -> Vec<String> {
    std::iter::once("-q".to_string())
        .chain(pipeline.split_whitespace().map(str::to_string))
        .collect()
}
