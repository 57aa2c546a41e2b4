//! Stitch quality metrics over the overlap of the two views.

use image::RgbImage;
use serde::{Deserialize, Serialize};

/// PSNR reported when the overlap matches exactly.
pub const PSNR_CAP: f64 = 100.0;

const SSIM_WINDOW: u32 = 8;
const SSIM_STRIDE: u32 = 4;
const C1: f64 = (0.01 * 255.0) * (0.01 * 255.0);
const C2: f64 = (0.03 * 255.0) * (0.03 * 255.0);

/// Stitch fidelity of one evaluated frame pair.
///
/// All zeros when there is nothing to compare yet (no transform or an
/// empty overlap).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualitySnapshot {
    /// Peak signal-to-noise ratio in dB.
    pub psnr: f64,
    /// Mean structural similarity per channel (R, G, B).
    pub mssim: [f64; 3],
}

impl QualitySnapshot {
    /// Whether the snapshot carries a measurement.
    pub fn is_measured(&self) -> bool {
        self.psnr > 0.0 || self.mssim.iter().any(|&v| v != 0.0)
    }

    /// Channel-averaged MSSIM.
    pub fn mean_ssim(&self) -> f64 {
        self.mssim.iter().sum::<f64>() / 3.0
    }
}

/// Compare two aligned images over the pixels where `overlap` is set.
///
/// `overlap` is row-major with one entry per pixel.
pub fn measure(a: &RgbImage, b: &RgbImage, overlap: &[bool]) -> QualitySnapshot {
    if a.dimensions() != b.dimensions() || overlap.len() != (a.width() * a.height()) as usize {
        return QualitySnapshot::default();
    }
    QualitySnapshot {
        psnr: psnr(a, b, overlap),
        mssim: mssim(a, b, overlap),
    }
}

/// Peak signal-to-noise ratio over the masked pixels, all channels.
pub fn psnr(a: &RgbImage, b: &RgbImage, overlap: &[bool]) -> f64 {
    let mut sse = 0.0_f64;
    let mut count = 0usize;
    for ((pa, pb), &inside) in a.pixels().zip(b.pixels()).zip(overlap) {
        if !inside {
            continue;
        }
        for c in 0..3 {
            let d = pa[c] as f64 - pb[c] as f64;
            sse += d * d;
        }
        count += 3;
    }

    if count == 0 {
        return 0.0;
    }
    let mse = sse / count as f64;
    if mse <= 1e-10 {
        return PSNR_CAP;
    }
    (10.0 * (255.0 * 255.0 / mse).log10()).min(PSNR_CAP)
}

/// Mean SSIM per channel over windows lying fully inside the overlap.
pub fn mssim(a: &RgbImage, b: &RgbImage, overlap: &[bool]) -> [f64; 3] {
    let (width, height) = a.dimensions();
    if width < SSIM_WINDOW || height < SSIM_WINDOW {
        return [0.0; 3];
    }

    let window_inside = |x0: u32, y0: u32| {
        (y0..y0 + SSIM_WINDOW).all(|y| {
            let row = (y * width) as usize;
            (x0..x0 + SSIM_WINDOW).all(|x| overlap[row + x as usize])
        })
    };

    let mut total = [0.0_f64; 3];
    let mut windows = 0usize;
    let n = (SSIM_WINDOW * SSIM_WINDOW) as f64;

    for y0 in (0..=height - SSIM_WINDOW).step_by(SSIM_STRIDE as usize) {
        for x0 in (0..=width - SSIM_WINDOW).step_by(SSIM_STRIDE as usize) {
            if !window_inside(x0, y0) {
                continue;
            }
            windows += 1;

            for (c, slot) in total.iter_mut().enumerate() {
                let (mut sa, mut sb, mut saa, mut sbb, mut sab) = (0.0, 0.0, 0.0, 0.0, 0.0);
                for y in y0..y0 + SSIM_WINDOW {
                    for x in x0..x0 + SSIM_WINDOW {
                        let va = a.get_pixel(x, y)[c] as f64;
                        let vb = b.get_pixel(x, y)[c] as f64;
                        sa += va;
                        sb += vb;
                        saa += va * va;
                        sbb += vb * vb;
                        sab += va * vb;
                    }
                }
                let (mu_a, mu_b) = (sa / n, sb / n);
                let var_a = saa / n - mu_a * mu_a;
                let var_b = sbb / n - mu_b * mu_b;
                let cov = sab / n - mu_a * mu_b;

                *slot += ((2.0 * mu_a * mu_b + C1) * (2.0 * cov + C2))
                    / ((mu_a * mu_a + mu_b * mu_b + C1) * (var_a + var_b + C2));
            }
        }
    }

    if windows == 0 {
        return [0.0; 3];
    }
    total.map(|t| t / windows as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn test_identical_images() {
        let img = gradient(32, 24);
        let mask = vec![true; 32 * 24];
        let q = measure(&img, &img, &mask);
        assert_eq!(q.psnr, PSNR_CAP);
        for v in q.mssim {
            assert!((v - 1.0).abs() < 1e-9);
        }
        assert!(q.is_measured());
    }

    #[test]
    fn test_constant_offset_psnr() {
        let a = RgbImage::from_pixel(16, 16, Rgb([0, 0, 0]));
        let b = RgbImage::from_pixel(16, 16, Rgb([10, 10, 10]));
        let mask = vec![true; 16 * 16];
        let expected = 10.0 * (255.0_f64 * 255.0 / 100.0).log10();
        assert!((psnr(&a, &b, &mask) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_mask_limits_comparison() {
        let a = gradient(16, 16);
        let mut b = a.clone();
        // Differences outside the overlap do not count.
        for x in 8..16 {
            for y in 0..16 {
                b.put_pixel(x, y, Rgb([255, 0, 255]));
            }
        }
        let mask: Vec<bool> = (0..16 * 16).map(|i| i % 16 < 8).collect();
        assert_eq!(psnr(&a, &b, &mask), PSNR_CAP);
        let ssim = mssim(&a, &b, &mask);
        assert!(ssim.iter().all(|v| (v - 1.0).abs() < 1e-9));
    }

    #[test]
    fn test_empty_overlap_is_zeroed() {
        let img = gradient(16, 16);
        let q = measure(&img, &img, &vec![false; 16 * 16]);
        assert_eq!(q, QualitySnapshot::default());
        assert!(!q.is_measured());
    }

    #[test]
    fn test_size_mismatch_is_zeroed() {
        let q = measure(&gradient(16, 16), &gradient(8, 8), &vec![true; 64]);
        assert_eq!(q, QualitySnapshot::default());
    }
}
