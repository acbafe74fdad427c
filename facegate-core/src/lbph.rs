//! Local Binary Pattern Histogram face recognizer.

use crate::vision::{Prediction, Recognizer, VisionError};
use image::{GrayImage, Luma};
use ndarray::Array1;
use serde::{Deserialize, Serialize};

const BINS: usize = 256;

/// Neighbour offsets (dy, dx) around the center pixel, most significant bit first
const NEIGHBOURS: [(i32, i32); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
    (1, 0),
    (1, -1),
    (0, -1),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbphParams {
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self { grid_x: 8, grid_y: 8 }
    }
}

/// Radius-1, 8-neighbour LBP codes. Border pixels are left at zero.
pub fn lbp_image(gray: &GrayImage) -> GrayImage {
    let (width, height) = gray.dimensions();
    let mut codes = GrayImage::new(width, height);
    if width < 3 || height < 3 {
        return codes;
    }

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let center = gray.get_pixel(x, y)[0];
            let mut code = 0u8;
            for (dy, dx) in NEIGHBOURS {
                let nx = (x as i32 + dx) as u32;
                let ny = (y as i32 + dy) as u32;
                code = (code << 1) | u8::from(gray.get_pixel(nx, ny)[0] >= center);
            }
            codes.put_pixel(x, y, Luma([code]));
        }
    }

    codes
}

/// 256-bin histogram of the LBP codes of a whole region
pub fn lbp_histogram(gray: &GrayImage) -> Vec<u32> {
    let mut histogram = vec![0u32; BINS];
    for p in lbp_image(gray).pixels() {
        histogram[p[0] as usize] += 1;
    }
    histogram
}

/// Concatenated per-cell histograms, each normalized to sum to one
fn spatial_histogram(gray: &GrayImage, params: LbphParams) -> Array1<f32> {
    let codes = lbp_image(gray);
    let (width, height) = codes.dimensions();
    let cells = (params.grid_x * params.grid_y) as usize;
    let mut histogram = Array1::<f32>::zeros(cells * BINS);

    let cell_w = (width / params.grid_x).max(1);
    let cell_h = (height / params.grid_y).max(1);

    for cy in 0..params.grid_y {
        for cx in 0..params.grid_x {
            let offset = ((cy * params.grid_x + cx) as usize) * BINS;
            let x0 = cx * cell_w;
            let y0 = cy * cell_h;
            let mut total = 0u32;

            for y in y0..(y0 + cell_h).min(height) {
                for x in x0..(x0 + cell_w).min(width) {
                    histogram[offset + codes.get_pixel(x, y)[0] as usize] += 1.0;
                    total += 1;
                }
            }

            if total > 0 {
                let mut cell = histogram.slice_mut(ndarray::s![offset..offset + BINS]);
                cell /= total as f32;
            }
        }
    }

    histogram
}

/// Chi-square distance in its symmetric ("alternative") form
fn chi_square(a: &Array1<f32>, b: &Array1<f32>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let sum = (x + y) as f64;
            if sum > f64::EPSILON {
                let diff = (x - y) as f64;
                2.0 * diff * diff / sum
            } else {
                0.0
            }
        })
        .sum()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphRecognizer {
    params: LbphParams,
    histograms: Vec<Array1<f32>>,
    labels: Vec<i32>,
}

impl LbphRecognizer {
    /// A recognizer with no samples; it serializes but cannot predict
    pub fn empty(params: LbphParams) -> Self {
        Self {
            params,
            histograms: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn train(patches: &[GrayImage], labels: &[i32], params: LbphParams) -> Result<Self, VisionError> {
        if patches.is_empty() {
            return Err(VisionError::Training("no training samples".to_string()));
        }
        if patches.len() != labels.len() {
            return Err(VisionError::Training(format!(
                "{} samples but {} labels",
                patches.len(),
                labels.len()
            )));
        }

        let histograms = patches.iter().map(|p| spatial_histogram(p, params)).collect();
        log::debug!("LBPH trained on {} samples", patches.len());

        Ok(Self {
            params,
            histograms,
            labels: labels.to_vec(),
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VisionError> {
        bincode::deserialize(bytes).map_err(|e| VisionError::Serialization(e.to_string()))
    }
}

impl Recognizer for LbphRecognizer {
    fn predict(&self, patch: &GrayImage) -> Result<Prediction, VisionError> {
        let query = spatial_histogram(patch, self.params);

        self.histograms
            .iter()
            .zip(&self.labels)
            .map(|(h, &label)| Prediction {
                label,
                distance: chi_square(h, &query),
            })
            .min_by(|a, b| a.distance.total_cmp(&b.distance))
            .ok_or(VisionError::NotTrained)
    }

    fn to_bytes(&self) -> Result<Vec<u8>, VisionError> {
        bincode::serialize(self).map_err(|e| VisionError::Serialization(e.to_string()))
    }

    fn is_trained(&self) -> bool {
        !self.histograms.is_empty()
    }

    fn sample_count(&self) -> usize {
        self.histograms.len()
    }

    fn model_type(&self) -> &'static str {
        "LBPH_Face_Recognizer"
    }
}
