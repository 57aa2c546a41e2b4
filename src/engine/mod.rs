//! Calibration engine: correspondence accumulation, homography estimation,
//! stitched previews, quality metrics and transform persistence.

mod features;
mod homography;
mod metrics;
mod stitch;
mod storage;

use image::RgbImage;
use std::path::PathBuf;
use thiserror::Error;

use crate::capture::FramePair;
use crate::config::SessionConfig;

pub use features::{
    match_features, Descriptor, DetectorOptions, FeatureExtractor, Features, Keypoint,
    MatchOptions, DESCRIPTOR_BITS, PATCH_RADIUS,
};
pub use homography::{
    estimate_homography, ransac_homography, Correspondence, Homography, RansacFit,
    RansacOptions, MIN_SAMPLES,
};
pub use metrics::{measure, mssim, psnr, QualitySnapshot, PSNR_CAP};
pub use stitch::{StitchEngine, MAX_CORRESPONDENCES, WORKING_SIZE};
pub use storage::{
    from_opencv_xml, to_opencv_xml, write_transform, TransformFormat, TransformRecord,
};

/// Engine errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid engine settings: {0}")]
    InvalidSettings(String),
    #[error("Frame size {actual:?} does not match calibrated size {expected:?}")]
    FrameSize {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("Failed to write {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Transform document error: {0}")]
    Xml(String),
    #[error("Transform cannot be applied: {0}")]
    Warp(String),
}

/// Result of an `estimate` request.
#[derive(Debug, Clone, PartialEq)]
pub enum EstimateOutcome {
    /// A new transform replaced the previous one.
    Updated { inliers: usize, rms: f64 },
    /// Not enough correspondences yet; state unchanged.
    InsufficientData { have: usize, need: usize },
    /// RANSAC found no consensus; the previous transform is kept.
    NoConsensus,
}

/// Result of a `save` request.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved(PathBuf),
    /// Nothing calibrated yet; nothing written.
    NoTransform,
}

/// The stitching calibration engine driven by the controller.
///
/// Implementations own all calibration state. Every verb may be called at
/// any time; missing data is reported through the outcome types rather
/// than as errors.
pub trait CalibrationEngine {
    /// Bind image size, output path and match mode.
    fn build(config: &SessionConfig) -> Result<Self, EngineError>
    where
        Self: Sized;

    /// Accumulate correspondences from one frame pair.
    fn feed(&mut self, pair: &FramePair) -> Result<(), EngineError>;

    /// Side-by-side overlay of the matches found in the last fed pair.
    fn visualize_matches(&self, pair: &FramePair) -> Result<RgbImage, EngineError>;

    /// Estimate the transform from the accumulated correspondences.
    fn estimate(&mut self) -> Result<EstimateOutcome, EngineError>;

    /// Stitch the pair with the current transform and score the overlap.
    fn evaluate(&self, pair: &FramePair) -> Result<(QualitySnapshot, RgbImage), EngineError>;

    /// Persist the current transform.
    fn save(&self) -> Result<SaveOutcome, EngineError>;

    /// Return to the freshly built state.
    fn reset(&mut self);
}

#[cfg(test)]
pub(crate) mod test_utils {
    use image::{GrayImage, Luma};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// Random 8x8 block texture, rich in corners.
    pub(crate) fn block_texture(width: u32, height: u32, seed: u64) -> GrayImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let bw = width.div_ceil(8);
        let bh = height.div_ceil(8);
        let blocks: Vec<u8> = (0..bw * bh).map(|_| rng.random_range(0..=255)).collect();
        GrayImage::from_fn(width, height, |x, y| {
            Luma([blocks[((y / 8) * bw + x / 8) as usize]])
        })
    }
}
