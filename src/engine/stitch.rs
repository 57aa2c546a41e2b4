//! Homography-based stitching engine for a two-camera rig.

use chrono::{DateTime, Utc};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_circle_mut, draw_line_segment_mut};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use nalgebra::Point2;
use std::collections::VecDeque;
use std::path::PathBuf;
use tracing::{debug, info};

use super::features::{match_features, DetectorOptions, FeatureExtractor, MatchOptions};
use super::homography::{ransac_homography, Correspondence, Homography, RansacOptions};
use super::metrics::{measure, QualitySnapshot};
use super::storage::{write_transform, TransformRecord};
use super::{CalibrationEngine, EngineError, EstimateOutcome, SaveOutcome};
use crate::capture::FramePair;
use crate::config::{MatchMode, SessionConfig};

/// Longest side of the images used for detection and previews.
pub const WORKING_SIZE: u32 = 640;

/// Correspondences kept across frames; the oldest are dropped first.
pub const MAX_CORRESPONDENCES: usize = 2000;

const MATCH_COLORS: [Rgb<u8>; 6] = [
    Rgb([255, 64, 64]),
    Rgb([64, 255, 64]),
    Rgb([64, 160, 255]),
    Rgb([255, 220, 64]),
    Rgb([255, 64, 255]),
    Rgb([64, 255, 255]),
];

#[derive(Debug, Clone)]
struct Calibration {
    /// Full-resolution transform, second camera onto the first.
    homography: Homography,
    inliers: usize,
    rms: f64,
    calibrated_at: DateTime<Utc>,
}

/// Calibration engine estimating the homography between the two views.
#[derive(Debug)]
pub struct StitchEngine {
    image_size: (u32, u32),
    working_size: (u32, u32),
    /// Working size over full size.
    scale: f64,
    output: PathBuf,
    match_mode: MatchMode,
    extractor: FeatureExtractor,
    match_options: MatchOptions,
    ransac: RansacOptions,
    correspondences: VecDeque<Correspondence>,
    last_matches: Vec<Correspondence>,
    calibration: Option<Calibration>,
}

impl StitchEngine {
    /// Current full-resolution transform, if one has been estimated.
    pub fn transform(&self) -> Option<&Homography> {
        self.calibration.as_ref().map(|c| &c.homography)
    }

    /// Number of correspondences currently accumulated.
    pub fn correspondence_count(&self) -> usize {
        self.correspondences.len()
    }

    pub fn working_size(&self) -> (u32, u32) {
        self.working_size
    }

    fn check_size(&self, pair: &FramePair) -> Result<(), EngineError> {
        let actual = pair.dimensions();
        if actual != self.image_size {
            return Err(EngineError::FrameSize {
                expected: self.image_size,
                actual,
            });
        }
        Ok(())
    }

    fn to_working(&self, frame: &RgbImage) -> RgbImage {
        if self.working_size == self.image_size {
            return frame.clone();
        }
        let (w, h) = self.working_size;
        imageops::resize(frame, w, h, FilterType::Triangle)
    }

    fn to_working_gray(&self, frame: &RgbImage) -> GrayImage {
        let gray = imageops::grayscale(frame);
        if self.working_size == self.image_size {
            return gray;
        }
        let (w, h) = self.working_size;
        imageops::resize(&gray, w, h, FilterType::Triangle)
    }

    fn side_by_side(left: &RgbImage, right: &RgbImage) -> RgbImage {
        let width = left.width() + right.width();
        let height = left.height().max(right.height());
        let mut canvas = RgbImage::new(width, height);
        imageops::replace(&mut canvas, left, 0, 0);
        imageops::replace(&mut canvas, right, left.width() as i64, 0);
        canvas
    }

    /// Warp the second view onto the first and blend the overlap.
    fn stitch(
        &self,
        first: &RgbImage,
        second: &RgbImage,
        homography: &Homography,
    ) -> Result<(QualitySnapshot, RgbImage), EngineError> {
        let (w, h) = (first.width() as f64, first.height() as f64);
        let working = homography.rescaled(self.scale);

        let mut min = (0.0_f64, 0.0_f64);
        let mut max = (w, h);
        for corner in [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)] {
            let p = working
                .apply(Point2::new(corner.0, corner.1))
                .ok_or_else(|| EngineError::Warp("corner maps to infinity".to_string()))?;
            min = (min.0.min(p.x), min.1.min(p.y));
            max = (max.0.max(p.x), max.1.max(p.y));
        }
        // Keep the canvas bounded for strongly skewed estimates.
        let min = (min.0.max(-w).floor(), min.1.max(-h).floor());
        let max = (max.0.min(2.0 * w).ceil(), max.1.min(2.0 * h).ceil());

        let canvas_w = (max.0 - min.0) as u32;
        let canvas_h = (max.1 - min.1) as u32;
        let (tx, ty) = (-min.0, -min.1);

        let projection = Projection::from_matrix(working.translated(tx, ty).to_f32_row_major())
            .ok_or_else(|| EngineError::Warp("singular transform".to_string()))?;

        let mut warped = RgbImage::new(canvas_w, canvas_h);
        warp_into(
            second,
            &projection,
            Interpolation::Bilinear,
            Rgb([0, 0, 0]),
            &mut warped,
        );
        let coverage = GrayImage::from_pixel(second.width(), second.height(), Luma([255]));
        let mut warped_coverage = GrayImage::new(canvas_w, canvas_h);
        warp_into(
            &coverage,
            &projection,
            Interpolation::Nearest,
            Luma([0]),
            &mut warped_coverage,
        );

        let mut placed = RgbImage::new(canvas_w, canvas_h);
        imageops::replace(&mut placed, first, tx as i64, ty as i64);
        let (fx0, fy0) = (tx as u32, ty as u32);
        let (fx1, fy1) = (fx0 + first.width(), fy0 + first.height());

        let mut stitched = RgbImage::new(canvas_w, canvas_h);
        let mut overlap = vec![false; (canvas_w * canvas_h) as usize];
        for (x, y, out) in stitched.enumerate_pixels_mut() {
            let in_first = x >= fx0 && x < fx1 && y >= fy0 && y < fy1;
            let in_second = warped_coverage.get_pixel(x, y)[0] > 0;
            let a = placed.get_pixel(x, y);
            let b = warped.get_pixel(x, y);
            *out = match (in_first, in_second) {
                (true, true) => {
                    overlap[(y * canvas_w + x) as usize] = true;
                    Rgb([
                        ((a[0] as u16 + b[0] as u16) / 2) as u8,
                        ((a[1] as u16 + b[1] as u16) / 2) as u8,
                        ((a[2] as u16 + b[2] as u16) / 2) as u8,
                    ])
                }
                (true, false) => *a,
                (false, true) => *b,
                (false, false) => Rgb([0, 0, 0]),
            };
        }

        let quality = measure(&placed, &warped, &overlap);
        Ok((quality, stitched))
    }
}

impl CalibrationEngine for StitchEngine {
    fn build(config: &SessionConfig) -> Result<Self, EngineError> {
        let (width, height) = (config.width, config.height);
        if width == 0 || height == 0 {
            return Err(EngineError::InvalidSettings(format!(
                "image size {}x{}",
                width, height
            )));
        }
        if config.output.as_os_str().is_empty() {
            return Err(EngineError::InvalidSettings(
                "output path is empty".to_string(),
            ));
        }

        let scale = (WORKING_SIZE as f64 / width.max(height) as f64).min(1.0);
        let working_size = (
            ((width as f64 * scale).round() as u32).max(1),
            ((height as f64 * scale).round() as u32).max(1),
        );

        debug!(
            "Engine bound to {}x{} (working {}x{}), mode {}",
            width, height, working_size.0, working_size.1, config.match_mode
        );

        Ok(Self {
            image_size: (width, height),
            working_size,
            scale,
            output: config.output.clone(),
            match_mode: config.match_mode,
            extractor: FeatureExtractor::new(
                DetectorOptions::default().with_mode(config.match_mode),
            ),
            match_options: MatchOptions::default(),
            ransac: RansacOptions::default(),
            correspondences: VecDeque::with_capacity(MAX_CORRESPONDENCES),
            last_matches: Vec::new(),
            calibration: None,
        })
    }

    fn feed(&mut self, pair: &FramePair) -> Result<(), EngineError> {
        self.check_size(pair)?;

        let first = self.extractor.extract(&self.to_working_gray(&pair.first));
        let second = self.extractor.extract(&self.to_working_gray(&pair.second));
        let matches = match_features(&second, &first, &self.match_options);

        let to_full = |x: f32, y: f32| Point2::new(x as f64 / self.scale, y as f64 / self.scale);
        self.last_matches = matches
            .into_iter()
            .map(|(s, f)| {
                let (ks, kf) = (second.keypoints[s], first.keypoints[f]);
                Correspondence::new(to_full(ks.x, ks.y), to_full(kf.x, kf.y))
            })
            .collect();

        for c in &self.last_matches {
            if self.correspondences.len() == MAX_CORRESPONDENCES {
                self.correspondences.pop_front();
            }
            self.correspondences.push_back(*c);
        }

        debug!(
            "Fed pair: {}/{} features, {} matches, {} accumulated",
            first.len(),
            second.len(),
            self.last_matches.len(),
            self.correspondences.len()
        );
        Ok(())
    }

    fn visualize_matches(&self, pair: &FramePair) -> Result<RgbImage, EngineError> {
        self.check_size(pair)?;

        let first = self.to_working(&pair.first);
        let offset = first.width() as f32;
        let mut canvas = Self::side_by_side(&first, &self.to_working(&pair.second));

        let scale = self.scale as f32;
        for (i, c) in self.last_matches.iter().enumerate() {
            let color = MATCH_COLORS[i % MATCH_COLORS.len()];
            let a = (c.dst.x as f32 * scale, c.dst.y as f32 * scale);
            let b = (c.src.x as f32 * scale + offset, c.src.y as f32 * scale);
            draw_line_segment_mut(&mut canvas, a, b, color);
            draw_hollow_circle_mut(&mut canvas, (a.0 as i32, a.1 as i32), 3, color);
            draw_hollow_circle_mut(&mut canvas, (b.0 as i32, b.1 as i32), 3, color);
        }
        Ok(canvas)
    }

    fn estimate(&mut self) -> Result<EstimateOutcome, EngineError> {
        let have = self.correspondences.len();
        let need = self.ransac.min_inliers;
        if have < need {
            info!("Estimate skipped: {} of {} correspondences", have, need);
            return Ok(EstimateOutcome::InsufficientData { have, need });
        }

        let data: Vec<Correspondence> = self.correspondences.iter().copied().collect();
        let Some(fit) = ransac_homography(&data, &self.ransac) else {
            info!("Estimate found no consensus over {} correspondences", have);
            return Ok(EstimateOutcome::NoConsensus);
        };

        let inliers = fit.inliers.len();
        let rms = fit.inlier_rms;
        info!(
            "Transform updated: {} inliers of {}, rms {:.3} px, {} iterations",
            inliers, have, rms, fit.iters
        );
        self.calibration = Some(Calibration {
            homography: fit.model,
            inliers,
            rms,
            calibrated_at: Utc::now(),
        });
        Ok(EstimateOutcome::Updated { inliers, rms })
    }

    fn evaluate(&self, pair: &FramePair) -> Result<(QualitySnapshot, RgbImage), EngineError> {
        self.check_size(pair)?;

        let first = self.to_working(&pair.first);
        let second = self.to_working(&pair.second);
        match &self.calibration {
            Some(calibration) => self.stitch(&first, &second, &calibration.homography),
            None => Ok((QualitySnapshot::default(), Self::side_by_side(&first, &second))),
        }
    }

    fn save(&self) -> Result<SaveOutcome, EngineError> {
        let Some(calibration) = &self.calibration else {
            info!("Nothing to save: no transform estimated yet");
            return Ok(SaveOutcome::NoTransform);
        };

        let record = TransformRecord {
            image_size: [self.image_size.0, self.image_size.1],
            homography: calibration.homography.to_array(),
            match_mode: self.match_mode,
            inliers: calibration.inliers,
            rms: calibration.rms,
            calibrated_at: calibration.calibrated_at,
        };
        let path = write_transform(&self.output, &record)?;
        info!("Transform saved to {}", path.display());
        Ok(SaveOutcome::Saved(path))
    }

    fn reset(&mut self) {
        self.correspondences.clear();
        self.last_matches.clear();
        self.calibration = None;
        info!("Calibration state reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_utils::block_texture;

    const SHIFT: u32 = 64;

    fn scene_pair(width: u32, height: u32) -> FramePair {
        let scene = block_texture(width + SHIFT, height, 3);
        let rgb = RgbImage::from_fn(scene.width(), scene.height(), |x, y| {
            let v = scene.get_pixel(x, y)[0];
            Rgb([v, v, v])
        });
        let first = imageops::crop_imm(&rgb, 0, 0, width, height).to_image();
        let second = imageops::crop_imm(&rgb, SHIFT, 0, width, height).to_image();
        FramePair::new(first, second).unwrap()
    }

    fn engine(width: u32, height: u32, output: PathBuf) -> StitchEngine {
        let config = SessionConfig::default()
            .with_size(width, height)
            .with_output(output);
        StitchEngine::build(&config).unwrap()
    }

    #[test]
    fn test_build_rejects_bad_settings() {
        let zero = SessionConfig::default().with_size(0, 1080);
        assert!(matches!(
            StitchEngine::build(&zero),
            Err(EngineError::InvalidSettings(_))
        ));

        let no_output = SessionConfig::default().with_output(PathBuf::new());
        assert!(StitchEngine::build(&no_output).is_err());
    }

    #[test]
    fn test_working_scale() {
        let e = engine(1920, 1080, PathBuf::from("cameras.xml"));
        assert_eq!(e.working_size(), (640, 360));

        let small = engine(320, 240, PathBuf::from("cameras.xml"));
        assert_eq!(small.working_size(), (320, 240));
    }

    #[test]
    fn test_estimate_without_data() {
        let mut e = engine(320, 240, PathBuf::from("cameras.xml"));
        assert_eq!(
            e.estimate().unwrap(),
            EstimateOutcome::InsufficientData { have: 0, need: 8 }
        );
        assert!(e.transform().is_none());
    }

    #[test]
    fn test_feed_rejects_wrong_size() {
        let mut e = engine(320, 240, PathBuf::from("cameras.xml"));
        let pair = scene_pair(200, 100);
        assert!(matches!(
            e.feed(&pair),
            Err(EngineError::FrameSize { .. })
        ));
    }

    #[test]
    fn test_evaluate_before_calibration() {
        let e = engine(1920, 1080, PathBuf::from("cameras.xml"));
        let pair = FramePair::new(RgbImage::new(1920, 1080), RgbImage::new(1920, 1080)).unwrap();
        let (quality, composite) = e.evaluate(&pair).unwrap();
        assert_eq!(quality, QualitySnapshot::default());
        assert_eq!(composite.dimensions(), (1280, 360));
    }

    #[test]
    fn test_calibrates_translated_scene() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("cameras.xml");
        let mut e = engine(320, 240, output.clone());
        let pair = scene_pair(320, 240);

        e.feed(&pair).unwrap();
        assert!(e.correspondence_count() >= 8);

        let overlay = e.visualize_matches(&pair).unwrap();
        assert_eq!(overlay.dimensions(), (640, 240));

        match e.estimate().unwrap() {
            EstimateOutcome::Updated { inliers, rms } => {
                assert!(inliers >= 8);
                assert!(rms < 3.0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let h = e.transform().unwrap();
        let p = h.apply(Point2::new(100.0, 120.0)).unwrap();
        assert!((p.x - 164.0).abs() < 1.0, "x = {}", p.x);
        assert!((p.y - 120.0).abs() < 1.0, "y = {}", p.y);

        let (quality, stitched) = e.evaluate(&pair).unwrap();
        assert!(quality.is_measured());
        assert!(quality.psnr > 20.0, "psnr = {}", quality.psnr);
        assert!((383..=386).contains(&stitched.width()));

        assert_eq!(e.save().unwrap(), SaveOutcome::Saved(output.clone()));
        let xml = std::fs::read_to_string(&output).unwrap();
        assert!(xml.contains("<image_size>\n  320 240</image_size>"));
    }

    #[test]
    fn test_estimate_is_idempotent() {
        let mut e = engine(320, 240, PathBuf::from("cameras.xml"));
        e.feed(&scene_pair(320, 240)).unwrap();

        e.estimate().unwrap();
        let first = *e.transform().unwrap();
        e.estimate().unwrap();
        assert_eq!(*e.transform().unwrap(), first);
    }

    #[test]
    fn test_reset_then_save_matches_fresh_engine() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("cameras.xml");

        let fresh = engine(320, 240, output.clone());
        assert_eq!(fresh.save().unwrap(), SaveOutcome::NoTransform);

        let mut e = engine(320, 240, output.clone());
        e.feed(&scene_pair(320, 240)).unwrap();
        e.estimate().unwrap();
        e.reset();

        assert_eq!(e.correspondence_count(), 0);
        assert!(e.transform().is_none());
        assert_eq!(e.save().unwrap(), SaveOutcome::NoTransform);
        assert!(!output.exists());
    }

    #[test]
    fn test_correspondence_buffer_is_bounded() {
        let mut e = engine(320, 240, PathBuf::from("cameras.xml"));
        let pair = scene_pair(320, 240);
        e.feed(&pair).unwrap();
        let per_pair = e.correspondence_count();
        assert!(per_pair > 0);

        for _ in 0..(MAX_CORRESPONDENCES / per_pair + 2) {
            e.feed(&pair).unwrap();
        }
        assert_eq!(e.correspondence_count(), MAX_CORRESPONDENCES);
    }
}
