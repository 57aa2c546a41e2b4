//! Capture channels backed by a `gst-launch-1.0` child process.

use image::RgbImage;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::pipeline::{capture_pipeline, launch_args, GST_LAUNCH};
use super::source::{decode_frame, CaptureError, CaptureOpener, FrameSource};
use crate::config::{Channel, SessionConfig};

/// One camera streaming raw RGB frames through a GStreamer pipeline.
///
/// A reader task decodes frames from the child's stdout into a watch slot.
/// Each new frame replaces the previous one, so a slow consumer always gets
/// the latest frame. Dropping the capture aborts the reader and kills the
/// child.
pub struct GstCapture {
    channel: Channel,
    pipeline: String,
    child: Child,
    frames: watch::Receiver<Option<RgbImage>>,
    reader: JoinHandle<()>,
    frame_timeout: Duration,
}

impl GstCapture {
    /// Spawn the pipeline for `channel` and wait for its first frame.
    pub async fn open(config: &SessionConfig, channel: Channel) -> Result<Self, CaptureError> {
        let pipeline = capture_pipeline(config, channel);
        let open_error = |reason: String| CaptureError::Open {
            channel,
            pipeline: pipeline.clone(),
            reason,
        };

        tracing::debug!("Opening {} camera: {}", channel, pipeline);

        let mut child = Command::new(GST_LAUNCH)
            .args(launch_args(&pipeline))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| open_error(format!("cannot spawn {}: {}", GST_LAUNCH, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| open_error("child has no stdout".to_string()))?;

        let (tx, rx) = watch::channel(None);
        let reader = tokio::spawn(read_frames(
            stdout,
            config.width,
            config.height,
            channel,
            tx,
        ));

        let mut capture = Self {
            channel,
            pipeline: pipeline.clone(),
            child,
            frames: rx,
            reader,
            frame_timeout: config.frame_timeout,
        };

        // The first frame only proves the pipeline is live; it is not kept.
        match timeout(config.open_timeout, capture.frames.changed()).await {
            Ok(Ok(())) => {
                tracing::info!("{} camera streaming ({}x{})", channel, config.width, config.height);
                Ok(capture)
            }
            Ok(Err(_)) => Err(open_error("pipeline exited before the first frame".to_string())),
            Err(_) => Err(open_error(format!(
                "no frame within {} ms",
                config.open_timeout.as_millis()
            ))),
        }
    }

    /// Pipeline description this capture runs.
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }
}

impl FrameSource for GstCapture {
    async fn grab(&mut self) -> Result<RgbImage, CaptureError> {
        match timeout(self.frame_timeout, self.frames.changed()).await {
            Ok(Ok(())) => self
                .frames
                .borrow_and_update()
                .clone()
                .ok_or(CaptureError::Closed),
            Ok(Err(_)) => Err(CaptureError::Closed),
            Err(_) => Err(CaptureError::Timeout(self.frame_timeout.as_millis() as u64)),
        }
    }
}

impl Drop for GstCapture {
    fn drop(&mut self) {
        self.reader.abort();
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("{} camera already stopped: {}", self.channel, e);
        }
        tracing::debug!("Released {} camera", self.channel);
    }
}

/// Decode fixed-size frames from the pipe until it closes.
async fn read_frames<R: AsyncRead + Unpin>(
    mut stdout: R,
    width: u32,
    height: u32,
    channel: Channel,
    tx: watch::Sender<Option<RgbImage>>,
) {
    let frame_len = width as usize * height as usize * 3;

    loop {
        let mut buffer = vec![0u8; frame_len];
        if let Err(e) = stdout.read_exact(&mut buffer).await {
            if e.kind() != ErrorKind::UnexpectedEof {
                tracing::warn!("{} camera read failed: {}", channel, e);
            }
            break;
        }

        let frame = match decode_frame(buffer, width, height) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("{} camera: {}", channel, e);
                continue;
            }
        };

        // Replaces any frame the consumer has not taken yet.
        if tx.send(Some(frame)).is_err() {
            break;
        }
    }

    tracing::debug!("{} camera stream ended", channel);
}

/// Opens [`GstCapture`] channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct GstOpener;

impl CaptureOpener for GstOpener {
    type Source = GstCapture;

    async fn open(
        &self,
        config: &SessionConfig,
        channel: Channel,
    ) -> Result<GstCapture, CaptureError> {
        GstCapture::open(config, channel).await
    }
}
