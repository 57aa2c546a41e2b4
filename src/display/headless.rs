//! Headless previews: periodic PNG snapshots plus keys typed on stdin.

use chrono::Local;
use image::RgbImage;
use std::fs;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{format_quality, DisplayError, PresentationSink};
use crate::engine::QualitySnapshot;

/// File name of the match overlay snapshot.
pub const MATCHES_FILE: &str = "matches.png";

/// File name of the stitched preview snapshot.
pub const WARPING_FILE: &str = "warping.png";

/// Sink for rigs without a display.
///
/// Every `every` presented frames the two streams are written to
/// `<preview_dir>/session_<timestamp>/`. Keys are the first character of
/// each line read from stdin.
pub struct HeadlessSink {
    session_dir: PathBuf,
    every: u32,
    presented: u64,
    keys: mpsc::UnboundedReceiver<char>,
}

impl HeadlessSink {
    /// Create the session folder and start reading keys from stdin.
    pub fn new(preview_dir: &Path, every: u32) -> Result<Self, DisplayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if let Some(key) = line.trim().chars().next() {
                    if tx.send(key).is_err() {
                        break;
                    }
                }
            }
        });
        Self::with_keys(preview_dir, every, rx)
    }

    /// Create the sink with keys supplied by `keys`.
    pub fn with_keys(
        preview_dir: &Path,
        every: u32,
        keys: mpsc::UnboundedReceiver<char>,
    ) -> Result<Self, DisplayError> {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let session_dir = preview_dir.join(format!("session_{}", timestamp));
        fs::create_dir_all(&session_dir)?;
        info!(
            "Headless previews in {} (type c/s/r/q + Enter)",
            session_dir.display()
        );

        Ok(Self {
            session_dir,
            every,
            presented: 0,
            keys,
        })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }
}

impl PresentationSink for HeadlessSink {
    fn present(
        &mut self,
        matches: &RgbImage,
        stitched: &RgbImage,
        quality: &QualitySnapshot,
    ) -> Result<(), DisplayError> {
        let index = self.presented;
        self.presented += 1;
        debug!("Frame {}: {}", index, format_quality(quality));

        if self.every == 0 || index % self.every as u64 != 0 {
            return Ok(());
        }
        matches.save(self.session_dir.join(MATCHES_FILE))?;
        stitched.save(self.session_dir.join(WARPING_FILE))?;
        info!("Preview {}: {}", index, format_quality(quality));
        Ok(())
    }

    async fn poll_key(&mut self, wait: Duration) -> Option<char> {
        timeout(wait, self.keys.recv()).await.ok().flatten()
    }
}
