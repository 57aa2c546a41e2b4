//! Corner features, binary patch descriptors and descriptor matching.

use image::GrayImage;
use imageproc::corners::{corners_fast12, corners_fast9, Corner};
use imageproc::filter::gaussian_blur_f32;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::config::MatchMode;

/// Radius of the descriptor sampling patch.
pub const PATCH_RADIUS: i32 = 12;

/// Number of point-pair tests per descriptor.
pub const DESCRIPTOR_BITS: usize = 256;

const DESCRIPTOR_WORDS: usize = DESCRIPTOR_BITS / 64;
const PATTERN_SEED: u64 = 0xb41e_f00d;

/// A detected corner in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub score: f32,
}

/// 256-bit binary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u64; DESCRIPTOR_WORDS]);

impl Descriptor {
    /// Hamming distance.
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Keypoints with their descriptors, index-aligned.
#[derive(Debug, Clone, Default)]
pub struct Features {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

impl Features {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Detector parameters.
#[derive(Debug, Clone)]
pub struct DetectorOptions {
    pub mode: MatchMode,
    /// FAST intensity threshold.
    pub threshold: u8,
    /// Strongest corners kept per image.
    pub max_features: usize,
    /// Non-maximum suppression cell size in pixels.
    pub cell: u32,
    /// Smoothing applied before sampling descriptors.
    pub blur_sigma: f32,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            mode: MatchMode::Fast9,
            threshold: 20,
            max_features: 500,
            cell: 8,
            blur_sigma: 1.2,
        }
    }
}

impl DetectorOptions {
    pub fn with_mode(mut self, mode: MatchMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Matching parameters.
#[derive(Debug, Clone)]
pub struct MatchOptions {
    /// Largest accepted Hamming distance.
    pub max_distance: u32,
    /// Lowe ratio between best and second-best distance.
    pub ratio: f32,
    /// Keep only mutual nearest neighbours.
    pub cross_check: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            max_distance: 64,
            ratio: 0.8,
            cross_check: true,
        }
    }
}

/// Detects corners and describes them with a fixed sampling pattern.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    options: DetectorOptions,
    pattern: Vec<[(i32, i32); 2]>,
}

impl FeatureExtractor {
    pub fn new(options: DetectorOptions) -> Self {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let mut offset = || {
            (
                rng.random_range(-PATCH_RADIUS..=PATCH_RADIUS),
                rng.random_range(-PATCH_RADIUS..=PATCH_RADIUS),
            )
        };
        let pattern = (0..DESCRIPTOR_BITS).map(|_| [offset(), offset()]).collect();
        Self { options, pattern }
    }

    pub fn options(&self) -> &DetectorOptions {
        &self.options
    }

    /// Detect and describe features of a grayscale image.
    pub fn extract(&self, gray: &GrayImage) -> Features {
        let border = (PATCH_RADIUS + 1) as u32;
        let (width, height) = gray.dimensions();
        if width <= 2 * border || height <= 2 * border {
            return Features::default();
        }

        let corners = match self.options.mode {
            MatchMode::Fast9 => corners_fast9(gray, self.options.threshold),
            MatchMode::Fast12 => corners_fast12(gray, self.options.threshold),
        };

        let inside: Vec<Corner> = corners
            .into_iter()
            .filter(|c| {
                c.x >= border && c.y >= border && c.x < width - border && c.y < height - border
            })
            .collect();

        let keypoints = self.suppress(inside);
        let smoothed = gaussian_blur_f32(gray, self.options.blur_sigma);
        let descriptors = keypoints
            .iter()
            .map(|k| self.describe(&smoothed, k.x as i32, k.y as i32))
            .collect();

        Features {
            keypoints,
            descriptors,
        }
    }

    /// Keep the strongest corner per grid cell, then the strongest overall.
    fn suppress(&self, corners: Vec<Corner>) -> Vec<Keypoint> {
        let cell = self.options.cell.max(1);
        let mut best: HashMap<(u32, u32), Corner> = HashMap::new();
        for c in corners {
            let key = (c.x / cell, c.y / cell);
            match best.get(&key) {
                Some(existing) if existing.score >= c.score => {}
                _ => {
                    best.insert(key, c);
                }
            }
        }

        let mut kept: Vec<Corner> = best.into_values().collect();
        kept.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then((a.y, a.x).cmp(&(b.y, b.x)))
        });
        kept.truncate(self.options.max_features);

        kept.into_iter()
            .map(|c| Keypoint {
                x: c.x as f32,
                y: c.y as f32,
                score: c.score,
            })
            .collect()
    }

    fn describe(&self, smoothed: &GrayImage, x: i32, y: i32) -> Descriptor {
        let sample = |dx: i32, dy: i32| smoothed.get_pixel((x + dx) as u32, (y + dy) as u32)[0];
        let mut words = [0u64; DESCRIPTOR_WORDS];
        for (bit, [p, q]) in self.pattern.iter().enumerate() {
            if sample(p.0, p.1) < sample(q.0, q.1) {
                words[bit / 64] |= 1u64 << (bit % 64);
            }
        }
        Descriptor(words)
    }
}

/// Best and second-best candidate for one query descriptor.
fn nearest(query: &Descriptor, train: &[Descriptor]) -> Option<(usize, u32, Option<u32>)> {
    let mut best: Option<(usize, u32)> = None;
    let mut second: Option<u32> = None;
    for (j, d) in train.iter().enumerate() {
        let dist = query.distance(d);
        match best {
            Some((_, b)) if dist >= b => {
                if second.map_or(true, |s| dist < s) {
                    second = Some(dist);
                }
            }
            _ => {
                if let Some((_, b)) = best {
                    second = Some(b);
                }
                best = Some((j, dist));
            }
        }
    }
    best.map(|(j, dist)| (j, dist, second))
}

/// Match `query` features against `train` features.
///
/// Returns `(query_index, train_index)` pairs.
pub fn match_features(
    query: &Features,
    train: &Features,
    opts: &MatchOptions,
) -> Vec<(usize, usize)> {
    let mut matches = Vec::new();
    if query.is_empty() || train.is_empty() {
        return matches;
    }

    for (i, q) in query.descriptors.iter().enumerate() {
        let Some((j, dist, second)) = nearest(q, &train.descriptors) else {
            continue;
        };
        if dist > opts.max_distance {
            continue;
        }
        if let Some(second) = second {
            if dist as f32 >= opts.ratio * second as f32 {
                continue;
            }
        }
        if opts.cross_check {
            let back = nearest(&train.descriptors[j], &query.descriptors);
            if back.map(|(k, _, _)| k) != Some(i) {
                continue;
            }
        }
        matches.push((i, j));
    }

    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_utils::block_texture;
    use image::Luma;

    #[test]
    fn test_descriptor_distance() {
        let a = Descriptor([0, 0, 0, 0]);
        let b = Descriptor([0b1011, 0, u64::MAX, 0]);
        assert_eq!(a.distance(&a), 0);
        assert_eq!(a.distance(&b), 3 + 64);
    }

    #[test]
    fn test_extract_flat_image_has_no_features() {
        let extractor = FeatureExtractor::new(DetectorOptions::default());
        let flat = GrayImage::from_pixel(120, 90, Luma([128]));
        assert!(extractor.extract(&flat).is_empty());

        let tiny = GrayImage::new(20, 20);
        assert!(extractor.extract(&tiny).is_empty());
    }

    #[test]
    fn test_extract_respects_limits() {
        let options = DetectorOptions {
            max_features: 50,
            ..DetectorOptions::default()
        };
        let extractor = FeatureExtractor::new(options);
        let features = extractor.extract(&block_texture(200, 160, 7));
        assert!(!features.is_empty());
        assert!(features.len() <= 50);
        assert_eq!(features.keypoints.len(), features.descriptors.len());
        for k in &features.keypoints {
            assert!(k.x >= 13.0 && k.y >= 13.0 && k.x < 187.0 && k.y < 147.0);
        }
    }

    #[test]
    fn test_pattern_is_fixed() {
        let a = FeatureExtractor::new(DetectorOptions::default());
        let b = FeatureExtractor::new(DetectorOptions::default().with_mode(MatchMode::Fast12));
        assert_eq!(a.pattern, b.pattern);
    }

    #[test]
    fn test_match_translated_texture() {
        let scene = block_texture(260, 160, 11);
        let left = image::imageops::crop_imm(&scene, 0, 0, 200, 160).to_image();
        let right = image::imageops::crop_imm(&scene, 40, 0, 200, 160).to_image();

        let extractor = FeatureExtractor::new(DetectorOptions::default());
        let fl = extractor.extract(&left);
        let fr = extractor.extract(&right);
        let matches = match_features(&fr, &fl, &MatchOptions::default());
        assert!(matches.len() >= 8, "only {} matches", matches.len());

        let consistent = matches
            .iter()
            .filter(|&&(r, l)| {
                let (kr, kl) = (fr.keypoints[r], fl.keypoints[l]);
                (kr.x + 40.0 - kl.x).abs() <= 1.0 && (kr.y - kl.y).abs() <= 1.0
            })
            .count();
        assert!(consistent * 10 >= matches.len() * 8);
    }

    #[test]
    fn test_match_empty_sets() {
        let empty = Features::default();
        assert!(match_features(&empty, &empty, &MatchOptions::default()).is_empty());
    }
}
