use image::{imageops, GrayImage, RgbImage};
use imageproc::filter::laplacian_filter;
use serde::Serialize;

/// Laplacian variance that maps to a full sharpness score
const SHARPNESS_SCALE: f64 = 500.0;
/// Intensity standard deviation that maps to a full contrast score
const CONTRAST_SCALE: f64 = 64.0;
const MID_GRAY: f64 = 128.0;

/// Per-region quality estimate; every component is in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityScore {
    pub sharpness: f32,
    pub brightness: f32,
    pub contrast: f32,
    pub overall: f32,
}

impl QualityScore {
    /// Score a color face region
    pub fn of(region: &RgbImage) -> Self {
        Self::of_gray(&imageops::grayscale(region))
    }

    /// Unweighted mean of sharpness, brightness-centering and contrast
    pub fn of_gray(gray: &GrayImage) -> Self {
        if gray.width() == 0 || gray.height() == 0 {
            return Self {
                sharpness: 0.0,
                brightness: 0.0,
                contrast: 0.0,
                overall: 0.0,
            };
        }

        let (mean, std_dev) = mean_and_std(gray.pixels().map(|p| p[0] as f64));
        let (_, laplacian_std) = mean_and_std(laplacian_filter(gray).pixels().map(|p| p[0] as f64));
        let laplacian_variance = laplacian_std * laplacian_std;

        let sharpness = (laplacian_variance / SHARPNESS_SCALE).min(1.0);
        let brightness = (1.0 - (mean - MID_GRAY).abs() / MID_GRAY).clamp(0.0, 1.0);
        let contrast = (std_dev / CONTRAST_SCALE).min(1.0);
        let overall = (sharpness + brightness + contrast) / 3.0;

        Self {
            sharpness: sharpness as f32,
            brightness: brightness as f32,
            contrast: contrast as f32,
            overall: overall as f32,
        }
    }
}

/// Convenience wrapper returning only the blended score
pub fn score(region: &RgbImage) -> f32 {
    QualityScore::of(region).overall
}

/// Population mean and standard deviation in one pass
fn mean_and_std<I: Iterator<Item = f64>>(values: I) -> (f64, f64) {
    let mut count = 0u64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;

    for v in values {
        count += 1;
        sum += v;
        sum_sq += v * v;
    }

    if count == 0 {
        return (0.0, 0.0);
    }

    let mean = sum / count as f64;
    let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
    (mean, variance.sqrt())
}
