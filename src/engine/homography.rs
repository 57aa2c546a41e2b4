//! Planar homography between the two camera views.
//!
//! The transform maps pixel coordinates of the second camera onto the image
//! plane of the first: `p_first ~ H * p_second`.

use nalgebra::{DMatrix, Matrix3, Point2, Vector3};
use rand::prelude::IndexedRandom;
use rand::{rngs::StdRng, SeedableRng};

/// Minimal sample size for a homography.
pub const MIN_SAMPLES: usize = 4;

/// One feature correspondence: `src` in the second camera, `dst` in the first.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Correspondence {
    pub src: Point2<f64>,
    pub dst: Point2<f64>,
}

impl Correspondence {
    pub fn new(src: Point2<f64>, dst: Point2<f64>) -> Self {
        Self { src, dst }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Homography {
    pub h: Matrix3<f64>,
}

impl Homography {
    pub fn new(h: Matrix3<f64>) -> Self {
        Self { h }
    }

    pub fn identity() -> Self {
        Self::new(Matrix3::identity())
    }

    pub fn from_array(rows: [[f64; 3]; 3]) -> Self {
        Self::new(Matrix3::from_row_slice(&[
            rows[0][0], rows[0][1], rows[0][2], rows[1][0], rows[1][1], rows[1][2], rows[2][0],
            rows[2][1], rows[2][2],
        ]))
    }

    pub fn to_array(&self) -> [[f64; 3]; 3] {
        [
            [self.h[(0, 0)], self.h[(0, 1)], self.h[(0, 2)]],
            [self.h[(1, 0)], self.h[(1, 1)], self.h[(1, 2)]],
            [self.h[(2, 0)], self.h[(2, 1)], self.h[(2, 2)]],
        ]
    }

    /// Map a point; `None` when it lands on the line at infinity.
    #[inline]
    pub fn apply(&self, p: Point2<f64>) -> Option<Point2<f64>> {
        let v = self.h * Vector3::new(p.x, p.y, 1.0);
        if v[2].abs() < 1e-12 {
            return None;
        }
        Some(Point2::new(v[0] / v[2], v[1] / v[2]))
    }

    pub fn inverse(&self) -> Option<Self> {
        self.h.try_inverse().map(Self::new)
    }

    /// Express the same mapping for images resized by `scale`.
    pub fn rescaled(&self, scale: f64) -> Self {
        let s = Matrix3::new(scale, 0.0, 0.0, 0.0, scale, 0.0, 0.0, 0.0, 1.0);
        let s_inv = Matrix3::new(1.0 / scale, 0.0, 0.0, 0.0, 1.0 / scale, 0.0, 0.0, 0.0, 1.0);
        Self::new(s * self.h * s_inv)
    }

    /// Follow the mapping with a translation.
    pub fn translated(&self, tx: f64, ty: f64) -> Self {
        let t = Matrix3::new(1.0, 0.0, tx, 0.0, 1.0, ty, 0.0, 0.0, 1.0);
        Self::new(t * self.h)
    }

    /// Row-major `f32` coefficients, as expected by `imageproc` projections.
    pub fn to_f32_row_major(&self) -> [f32; 9] {
        let a = self.to_array();
        [
            a[0][0] as f32,
            a[0][1] as f32,
            a[0][2] as f32,
            a[1][0] as f32,
            a[1][1] as f32,
            a[1][2] as f32,
            a[2][0] as f32,
            a[2][1] as f32,
            a[2][2] as f32,
        ]
    }

    /// Distance between the mapped source and the destination.
    pub fn reprojection_error(&self, c: &Correspondence) -> f64 {
        match self.apply(c.src) {
            Some(p) => (p - c.dst).norm(),
            None => f64::INFINITY,
        }
    }
}

fn hartley_normalization(cx: f64, cy: f64, mean_dist: f64) -> Matrix3<f64> {
    let s = if mean_dist > 1e-12 {
        (2.0_f64).sqrt() / mean_dist
    } else {
        1.0
    };

    Matrix3::<f64>::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

fn normalize_points(pts: &[Point2<f64>]) -> (Vec<Point2<f64>>, Matrix3<f64>) {
    // Translate to centroid, scale so the mean distance is sqrt(2)
    let n = pts.len() as f64;
    let (cx, cy) = pts
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (cx, cy) = (cx / n, cy / n);

    let mean_dist = pts
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let t = hartley_normalization(cx, cy, mean_dist);
    let out = pts
        .iter()
        .map(|p| {
            let v = t * Vector3::new(p.x, p.y, 1.0);
            Point2::new(v[0], v[1])
        })
        .collect();
    (out, t)
}

/// Normalized DLT over all given correspondences (N >= 4).
pub fn estimate_homography(data: &[Correspondence]) -> Option<Homography> {
    if data.len() < MIN_SAMPLES {
        return None;
    }

    let src: Vec<Point2<f64>> = data.iter().map(|c| c.src).collect();
    let dst: Vec<Point2<f64>> = data.iter().map(|c| c.dst).collect();
    let (s, ts) = normalize_points(&src);
    let (d, td) = normalize_points(&dst);

    // At least 9 rows so the SVD exposes the full null space; zero rows
    // do not change the solution.
    let rows = (2 * data.len()).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);

    for k in 0..data.len() {
        let (x, y) = (s[k].x, s[k].y);
        let (u, v) = (d[k].x, d[k].y);

        a[(2 * k, 0)] = -x;
        a[(2 * k, 1)] = -y;
        a[(2 * k, 2)] = -1.0;
        a[(2 * k, 6)] = u * x;
        a[(2 * k, 7)] = u * y;
        a[(2 * k, 8)] = u;

        a[(2 * k + 1, 3)] = -x;
        a[(2 * k + 1, 4)] = -y;
        a[(2 * k + 1, 5)] = -1.0;
        a[(2 * k + 1, 6)] = v * x;
        a[(2 * k + 1, 7)] = v * y;
        a[(2 * k + 1, 8)] = v;
    }

    let svd = a.svd(false, true);
    let vt = svd.v_t?;
    let smallest = svd.singular_values.imin();
    let h = vt.row(smallest);

    let hn =
        Matrix3::<f64>::from_row_slice(&[h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]]);

    // H = Td^-1 * Hn * Ts
    let h_den = td.try_inverse()? * hn * ts;
    let scale = h_den[(2, 2)];
    if scale.abs() < 1e-12 || !h_den.iter().all(|v| v.is_finite()) {
        return None;
    }

    Some(Homography::new(h_den / scale))
}

/// RANSAC parameters for homography fitting.
#[derive(Debug, Clone)]
pub struct RansacOptions {
    /// Maximum number of iterations.
    pub max_iters: usize,
    /// Inlier reprojection threshold in pixels.
    pub thresh: f64,
    /// Minimum number of inliers required to accept a model.
    pub min_inliers: usize,
    /// Desired confidence in `[0, 1]`.
    pub confidence: f64,
    /// RNG seed; a fixed seed makes the fit reproducible.
    pub seed: u64,
}

impl Default for RansacOptions {
    fn default() -> Self {
        Self {
            max_iters: 2000,
            thresh: 3.0,
            min_inliers: 8,
            confidence: 0.99,
            seed: 0x5eed_ca11b,
        }
    }
}

/// Accepted RANSAC model.
#[derive(Debug, Clone)]
pub struct RansacFit {
    pub model: Homography,
    pub inliers: Vec<usize>,
    pub inlier_rms: f64,
    pub iters: usize,
}

fn rms(vals: &[f64]) -> f64 {
    if vals.is_empty() {
        return f64::INFINITY;
    }
    let ss: f64 = vals.iter().map(|&v| v * v).sum();
    (ss / (vals.len() as f64)).sqrt()
}

/// Dynamic iteration bound from the current inlier ratio.
fn calculate_iterations(
    confidence: f64,
    inlier_ratio: f64,
    iters_so_far: usize,
    max_iters: usize,
) -> usize {
    if confidence <= 0.0 || inlier_ratio <= 0.0 {
        return max_iters;
    }

    let denom = (1.0 - inlier_ratio.powi(MIN_SAMPLES as i32)).max(1e-12).ln();
    if denom >= 0.0 {
        return max_iters;
    }

    let n_iter = ((1.0 - confidence).ln() / denom).ceil() as usize;
    n_iter.clamp(iters_so_far, max_iters)
}

fn collinear(a: Point2<f64>, b: Point2<f64>, c: Point2<f64>) -> bool {
    let area = (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x);
    area.abs() < 1e-6
}

fn is_degenerate(data: &[Correspondence], sample: &[usize]) -> bool {
    let triples = [(0, 1, 2), (0, 1, 3), (0, 2, 3), (1, 2, 3)];
    triples.iter().any(|&(i, j, k)| {
        let (a, b, c) = (data[sample[i]], data[sample[j]], data[sample[k]]);
        collinear(a.src, b.src, c.src) || collinear(a.dst, b.dst, c.dst)
    })
}

fn collect_inliers(
    model: &Homography,
    data: &[Correspondence],
    thresh: f64,
) -> (Vec<usize>, Vec<f64>) {
    let mut inliers = Vec::new();
    let mut residuals = Vec::new();
    for (i, c) in data.iter().enumerate() {
        let r = model.reprojection_error(c);
        if r <= thresh {
            inliers.push(i);
            residuals.push(r);
        }
    }
    (inliers, residuals)
}

/// Robustly fit a homography; `None` when no consensus is found.
pub fn ransac_homography(data: &[Correspondence], opts: &RansacOptions) -> Option<RansacFit> {
    if data.len() < MIN_SAMPLES.max(opts.min_inliers) {
        return None;
    }

    let all_indices: Vec<usize> = (0..data.len()).collect();
    let mut sample = [0usize; MIN_SAMPLES];
    let mut rng = StdRng::seed_from_u64(opts.seed);

    let mut best: Option<RansacFit> = None;
    let mut dynamic_max_iters = opts.max_iters;
    let mut num_iters = 0;

    while num_iters < dynamic_max_iters {
        num_iters += 1;
        all_indices
            .as_slice()
            .choose_multiple(&mut rng, MIN_SAMPLES)
            .enumerate()
            .for_each(|(k, &idx)| sample[k] = idx);

        if is_degenerate(data, &sample) {
            continue;
        }

        let subset: Vec<Correspondence> = sample.iter().map(|&i| data[i]).collect();
        let Some(model) = estimate_homography(&subset) else {
            continue;
        };

        let (inliers, residuals) = collect_inliers(&model, data, opts.thresh);
        if inliers.len() < opts.min_inliers {
            continue;
        }

        let inlier_rms = rms(&residuals);
        let better = match &best {
            None => true,
            Some(b) => {
                inliers.len() > b.inliers.len()
                    || (inliers.len() == b.inliers.len() && inlier_rms < b.inlier_rms)
            }
        };

        if better {
            let ratio = inliers.len() as f64 / data.len() as f64;
            dynamic_max_iters =
                calculate_iterations(opts.confidence, ratio, num_iters, opts.max_iters);
            best = Some(RansacFit {
                model,
                inliers,
                inlier_rms,
                iters: num_iters,
            });
        }
    }

    let mut best = best?;
    best.iters = num_iters;

    // Refit on the consensus set and keep it only if it does not get worse.
    let consensus: Vec<Correspondence> = best.inliers.iter().map(|&i| data[i]).collect();
    if let Some(refit) = estimate_homography(&consensus) {
        let (inliers, residuals) = collect_inliers(&refit, data, opts.thresh);
        let refit_rms = rms(&residuals);
        if inliers.len() >= best.inliers.len() && refit_rms.is_finite() {
            best.model = refit;
            best.inliers = inliers;
            best.inlier_rms = refit_rms;
        }
    }

    Some(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_correspondences(truth: &Homography) -> Vec<Correspondence> {
        let mut data = Vec::new();
        for gy in 0..6 {
            for gx in 0..8 {
                let src = Point2::new(20.0 + gx as f64 * 37.0, 15.0 + gy as f64 * 29.0);
                let dst = truth.apply(src).unwrap();
                data.push(Correspondence::new(src, dst));
            }
        }
        data
    }

    fn assert_close(a: &Homography, b: &Homography, tol: f64) {
        for (x, y) in a.h.iter().zip(b.h.iter()) {
            assert!((x - y).abs() <= tol * (1.0 + y.abs()), "{} vs {}", a.h, b.h);
        }
    }

    #[test]
    fn test_dlt_recovers_projective_transform() {
        let truth = Homography::from_array([
            [0.98, 0.03, 310.0],
            [-0.02, 1.01, 4.5],
            [1.0e-5, -2.0e-5, 1.0],
        ]);
        let data = grid_correspondences(&truth);
        let estimate = estimate_homography(&data).unwrap();
        assert_close(&estimate, &truth, 1e-6);
    }

    #[test]
    fn test_dlt_needs_four_points() {
        let truth = Homography::identity().translated(5.0, 0.0);
        let data = grid_correspondences(&truth);
        assert!(estimate_homography(&data[..3]).is_none());
        let four = [data[0], data[7], data[40], data[47]];
        let estimate = estimate_homography(&four).unwrap();
        assert_close(&estimate, &truth, 1e-6);
    }

    #[test]
    fn test_ransac_rejects_outliers() {
        let truth = Homography::identity().translated(-250.0, 12.0);
        let mut data = grid_correspondences(&truth);
        // Corrupt every fifth correspondence.
        for c in data.iter_mut().step_by(5) {
            c.dst.x += 80.0;
            c.dst.y -= 45.0;
        }

        let fit = ransac_homography(&data, &RansacOptions::default()).unwrap();
        assert_close(&fit.model, &truth, 1e-6);
        assert_eq!(fit.inliers.len(), data.len() - data.len().div_ceil(5));
        assert!(fit.inlier_rms < 1e-6);
    }

    #[test]
    fn test_ransac_is_deterministic() {
        let truth = Homography::identity().translated(100.0, 3.0);
        let mut data = grid_correspondences(&truth);
        data[3].dst.x += 40.0;
        let opts = RansacOptions::default();
        let a = ransac_homography(&data, &opts).unwrap();
        let b = ransac_homography(&data, &opts).unwrap();
        assert_eq!(a.model, b.model);
        assert_eq!(a.inliers, b.inliers);
    }

    #[test]
    fn test_ransac_insufficient_data() {
        let data = grid_correspondences(&Homography::identity());
        assert!(ransac_homography(&data[..5], &RansacOptions::default()).is_none());
        assert!(ransac_homography(&[], &RansacOptions::default()).is_none());
    }

    #[test]
    fn test_rescaled_homography() {
        let h = Homography::identity().translated(100.0, 50.0);
        let half = h.rescaled(0.5);
        let p = half.apply(Point2::new(10.0, 10.0)).unwrap();
        assert!((p.x - 60.0).abs() < 1e-9);
        assert!((p.y - 35.0).abs() < 1e-9);
    }
}
