// Copyright 2025 camerascalib contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # camerascalib
//!
//! Interactive calibration of a two-camera rig for image stitching.
//!
//! Frames from both cameras are matched continuously; on request the
//! accumulated correspondences are turned into a homography that maps the
//! second view onto the first. The stitched preview and its PSNR/MSSIM
//! score show how well the current transform fits, and the transform can
//! be saved as OpenCV FileStorage XML or JSON.
//!
//! ## Example
//!
//! ```rust,no_run
//! use camerascalib::{
//!     launch, GstOpener, PreviewSink, DisplayOptions, SessionConfig, StitchEngine, StopFlag,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SessionConfig::default().with_size(1280, 720);
//!     let display = DisplayOptions::default();
//!
//!     let controller = launch::<_, StitchEngine, _, _>(
//!         &config,
//!         &GstOpener,
//!         || PreviewSink::open(&display),
//!         StopFlag::new(),
//!     )
//!     .await?;
//!
//!     let summary = controller.run().await;
//!     println!("{} iterations", summary.iterations);
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod config;
pub mod controller;
pub mod display;
pub mod engine;
pub mod session;
pub mod settings;

pub use capture::{CaptureError, CaptureOpener, FramePair, FrameSource, GstCapture, GstOpener};
pub use config::{CaptureBackend, Channel, ConfigError, MatchMode, SessionConfig};
pub use controller::{Command, Controller, LoopOptions, SessionSummary, StopFlag, StopReason};
pub use display::{DisplayError, DisplayOptions, PresentationSink, PreviewMode, PreviewSink};
pub use engine::{
    CalibrationEngine, EngineError, EstimateOutcome, Homography, QualitySnapshot, SaveOutcome,
    StitchEngine,
};
pub use session::{launch, ExitStatus, StartupError};
pub use settings::{RigSettings, SettingsOverrides};
