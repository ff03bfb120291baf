//! Per-frame scalar metrics used by the data thread.
//!
//! [`DctsEntropy`] is the autofocus sharpness metric: the Shannon entropy of the L2-normalised
//! 2-D DCT-II coefficients, restricted to the triangle of spatial frequencies the optical
//! transfer function can pass. [`TissueFraction`] scores how much of a frame holds sample.

use std::f64::consts::PI;
use std::sync::Arc;

use ndarray::{Array2, ArrayView2};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

pub trait FrameMetric: Send + Sync {
    fn name(&self) -> &str;
    fn score(&self, frame: ArrayView2<u16>) -> f64;
}

// Unnormalised DCT-II of every row, through a mirrored FFT of twice the row length.
fn dct2_rows(data: &mut Array2<f64>, fft: &Arc<dyn Fft<f64>>) {
    let n = data.ncols();
    let mut buffer = vec![Complex::new(0., 0.); 2 * n];
    for mut row in data.rows_mut() {
        for (i, &v) in row.iter().enumerate() {
            buffer[i] = Complex::new(v, 0.);
            buffer[2 * n - 1 - i] = Complex::new(v, 0.);
        }
        fft.process(&mut buffer);
        for (k, out) in row.iter_mut().enumerate() {
            let twiddle = Complex::from_polar(1., -PI * k as f64 / (2. * n as f64));
            *out = (twiddle * buffer[k]).re;
        }
    }
}

/// Separable 2-D DCT-II, scaled like the unnormalised type-2 transform
/// (`X_k = 2 * sum_n x_n cos(pi k (2n + 1) / 2N)` along each axis).
pub fn dct2(image: ArrayView2<f64>) -> Array2<f64> {
    let mut data = image.to_owned();
    if data.is_empty() {
        return data;
    }
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(2 * data.ncols());
    dct2_rows(&mut data, &fft);

    let mut data = data.reversed_axes();
    let fft = planner.plan_fft_forward(2 * data.ncols());
    dct2_rows(&mut data, &fft);
    data.reversed_axes()
}

/// Normalised DCT Shannon entropy.
pub struct DctsEntropy {
    /// PSF support diameter in pixels; the OTF support is the image size divided by it.
    /// Values below one pixel are scored as one.
    pub psf_support_diameter: f64,
}

impl Default for DctsEntropy {
    fn default() -> Self {
        Self {
            psf_support_diameter: 3.,
        }
    }
}

impl FrameMetric for DctsEntropy {
    fn name(&self) -> &str {
        "DCTS"
    }

    fn score(&self, frame: ArrayView2<u16>) -> f64 {
        let (height, width) = frame.dim();
        if height == 0 || width == 0 {
            return 0.;
        }
        let coefficients = dct2(frame.mapv(f64::from).view());
        let norm = coefficients.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm == 0. {
            return 0.;
        }

        let diameter = self.psf_support_diameter.max(1.);
        let otf_x = width as f64 / diameter;
        let otf_y = height as f64 / diameter;
        let mut entropy = 0.;
        for y in 0..(otf_y as usize).min(height) {
            let x_end = otf_x - y as f64 * (otf_x / otf_y);
            for x in 0..(x_end as usize).min(width) {
                let value = (coefficients[[y, x]] / norm).abs();
                if value > 0. {
                    entropy += value * value.ln();
                }
            }
        }
        -2. * entropy / (otf_x * otf_y)
    }
}

/// Fraction of pixels strictly above `threshold`.
pub struct TissueFraction {
    pub threshold: u16,
}

impl FrameMetric for TissueFraction {
    fn name(&self) -> &str {
        "tissue fraction"
    }

    fn score(&self, frame: ArrayView2<u16>) -> f64 {
        if frame.is_empty() {
            return 0.;
        }
        let above = frame.iter().filter(|&&v| v > self.threshold).count();
        above as f64 / frame.len() as f64
    }
}

/// Mean pixel value.
pub struct MeanIntensity;

impl FrameMetric for MeanIntensity {
    fn name(&self) -> &str {
        "mean intensity"
    }

    fn score(&self, frame: ArrayView2<u16>) -> f64 {
        frame.mapv(f64::from).mean().unwrap_or(0.)
    }
}

#[cfg(test)]
mod test {
    use crate::metric::*;
    use approx::assert_abs_diff_eq;

    fn stripes(contrast: f64) -> Array2<u16> {
        Array2::from_shape_fn((64, 64), |(_, x)| {
            (1000. + contrast * (2. * PI * x as f64 / 8.).cos()) as u16
        })
    }

    #[test]
    fn dct_matches_direct_sum() {
        let image = Array2::from_shape_fn((3, 4), |(y, x)| (y * 4 + x) as f64 * 0.5 - 1.);
        let dct = dct2(image.view());
        let (h, w) = (3, 4);
        for ky in 0..h {
            for kx in 0..w {
                let mut expected = 0.;
                for y in 0..h {
                    for x in 0..w {
                        expected += 4.
                            * image[[y, x]]
                            * (PI * ky as f64 * (2 * y + 1) as f64 / (2 * h) as f64).cos()
                            * (PI * kx as f64 * (2 * x + 1) as f64 / (2 * w) as f64).cos();
                    }
                }
                assert_abs_diff_eq!(dct[[ky, kx]], expected, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn entropy_grows_with_contrast() {
        let metric = DctsEntropy::default();
        let flat = metric.score(stripes(0.).view());
        let soft = metric.score(stripes(50.).view());
        let sharp = metric.score(stripes(400.).view());
        assert_abs_diff_eq!(flat, 0., epsilon = 1e-12);
        assert!(soft > flat);
        assert!(sharp > soft);
        assert_eq!(metric.score(Array2::zeros((8, 8)).view()), 0.);
    }

    #[test]
    fn sub_pixel_psf_scores_like_one_pixel() {
        let frame = stripes(200.);
        let one_pixel = DctsEntropy {
            psf_support_diameter: 1.,
        }
        .score(frame.view());
        assert!(one_pixel > 0.);
        for diameter in [0.5, 0., -2., f64::NAN] {
            let score = DctsEntropy {
                psf_support_diameter: diameter,
            }
            .score(frame.view());
            assert_abs_diff_eq!(score, one_pixel, epsilon = 1e-12);
        }
    }

    #[test]
    fn tissue_fraction_and_mean() {
        let frame = Array2::from_shape_fn((2, 5), |(y, x)| (y * 5 + x) as u16 * 100);
        assert_abs_diff_eq!(TissueFraction { threshold: 450 }.score(frame.view()), 0.5);
        assert_abs_diff_eq!(MeanIntensity.score(frame.view()), 450.);
        assert_eq!(MeanIntensity.score(Array2::<u16>::zeros((0, 0)).view()), 0.);
    }
}
