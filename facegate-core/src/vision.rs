//! Boundary with the vision capability provider: face/eye detection, feature
//! extraction and a trainable classifier.

use image::{imageops, GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VisionError {
    #[error("Vision backend unavailable: {0}")]
    Unavailable(String),
    #[error("Detection failed: {0}")]
    Detection(String),
    #[error("Feature extraction failed: {0}")]
    Features(String),
    #[error("Training failed: {0}")]
    Training(String),
    #[error("Recognizer is not trained")]
    NotTrained,
    #[error("Model serialization failed: {0}")]
    Serialization(String),
}

/// Integer pixel rectangle, serialized as `{x, y, width, height}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Center using integer halving, so a fixed box always maps to the same point
    pub fn center(&self) -> Point {
        Point::new(
            (self.x + (self.width / 2) as i32) as f32,
            (self.y + (self.height / 2) as i32) as f32,
        )
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersect with a `width` x `height` image; `None` if nothing is left
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Rect> {
        let x1 = self.x.max(0) as i64;
        let y1 = self.y.max(0) as i64;
        let x2 = (self.x as i64 + self.width as i64).min(width as i64);
        let y2 = (self.y as i64 + self.height as i64).min(height as i64);

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        Some(Rect::new(x1 as i32, y1 as i32, (x2 - x1) as u32, (y2 - y1) as u32))
    }

    /// Copy the part of `frame` covered by this rectangle
    pub fn crop(&self, frame: &RgbImage) -> Option<RgbImage> {
        let r = self.clamp_to(frame.width(), frame.height())?;
        Some(imageops::crop_imm(frame, r.x as u32, r.y as u32, r.width, r.height).to_image())
    }
}

/// One detector hit for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceCandidate {
    pub rect: Rect,
    /// 1.0 when the detector does not score its hits
    pub confidence: f32,
}

/// Pick the face to track: highest confidence when the detector scores its
/// hits, largest box otherwise. Ties keep the earlier candidate.
pub fn select_best(candidates: &[FaceCandidate], scored: bool) -> Option<FaceCandidate> {
    candidates.iter().copied().fold(None, |best, candidate| match best {
        None => Some(candidate),
        Some(current) => {
            let better = if scored {
                candidate.confidence > current.confidence
            } else {
                candidate.rect.area() > current.rect.area()
            };
            Some(if better { candidate } else { current })
        }
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometricSummary {
    pub face_width: u32,
    pub face_height: u32,
    pub aspect_ratio: f32,
    pub area: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eye_distance: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eye_face_ratio: Option<f32>,
}

impl GeometricSummary {
    /// Summarize a face region; eye measurements need at least two eye boxes
    pub fn measure(width: u32, height: u32, eyes: &[Rect]) -> Self {
        let aspect_ratio = if height > 0 {
            width as f32 / height as f32
        } else {
            0.0
        };

        let mut sorted = eyes.to_vec();
        sorted.sort_by_key(|e| e.x);

        let eye_distance = match sorted.as_slice() {
            [left, right, ..] => {
                let dx = (right.x - left.x) as f32;
                let dy = (right.y - left.y) as f32;
                Some((dx * dx + dy * dy).sqrt())
            }
            _ => None,
        };
        let eye_face_ratio = eye_distance.map(|d| if width > 0 { d / width as f32 } else { 0.0 });

        Self {
            face_width: width,
            face_height: height,
            aspect_ratio,
            area: width as u64 * height as u64,
            eye_distance,
            eye_face_ratio,
        }
    }
}

/// Features for one face region; each kind is independently present or absent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub primary_descriptors: Option<Vec<Vec<f32>>>,
    pub secondary_descriptors: Option<Vec<Vec<f32>>>,
    pub lbp_histogram: Option<Vec<u32>>,
    pub geometry: Option<GeometricSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: i32,
    /// Lower is closer
    pub distance: f64,
}

/// A trained (or deliberately untrained) classifier. Instances are shared
/// behind `Arc` and replaced wholesale, never updated in place.
pub trait Recognizer: Send + Sync {
    fn predict(&self, patch: &GrayImage) -> Result<Prediction, VisionError>;

    fn to_bytes(&self) -> Result<Vec<u8>, VisionError>;

    fn is_trained(&self) -> bool;

    fn sample_count(&self) -> usize;

    /// Model family name recorded in the metadata sidecar
    fn model_type(&self) -> &'static str;
}

pub trait VisionProvider: Send {
    /// Whether `detect_faces` reports meaningful confidences
    fn reports_confidence(&self) -> bool;

    fn detect_faces(&mut self, frame: &RgbImage) -> Result<Vec<FaceCandidate>, VisionError>;

    /// Eye boxes relative to `region`
    fn detect_eyes(&mut self, region: &RgbImage) -> Result<Vec<Rect>, VisionError>;

    fn extract_features(&mut self, region: &RgbImage) -> Result<FeatureSet, VisionError>;

    /// Fails when `patches` is empty or its length differs from `labels`
    fn train(&self, patches: &[GrayImage], labels: &[i32]) -> Result<Arc<dyn Recognizer>, VisionError>;

    /// A valid, serializable model that has seen no samples
    fn empty_model(&self) -> Arc<dyn Recognizer>;

    fn model_from_bytes(&self, bytes: &[u8]) -> Result<Arc<dyn Recognizer>, VisionError>;
}

/// Normalize a face region into the canonical grayscale training patch
pub fn training_patch(region: &RgbImage, size: u32) -> GrayImage {
    let gray = imageops::grayscale(region);
    imageops::resize(&gray, size, size, imageops::FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(x: i32, w: u32, confidence: f32) -> FaceCandidate {
        FaceCandidate {
            rect: Rect::new(x, 0, w, w),
            confidence,
        }
    }

    #[test]
    fn test_select_best_by_confidence() {
        let faces = [candidate(0, 200, 0.7), candidate(10, 50, 0.95), candidate(20, 100, 0.8)];
        let best = select_best(&faces, true).unwrap();
        assert_eq!(best.rect.x, 10);
    }

    #[test]
    fn test_select_best_by_area() {
        let faces = [candidate(0, 100, 1.0), candidate(10, 300, 1.0), candidate(20, 300, 1.0)];
        let best = select_best(&faces, false).unwrap();
        // Equal areas keep the first one seen
        assert_eq!(best.rect.x, 10);
        assert!(select_best(&[], false).is_none());
    }

    #[test]
    fn test_rect_center_and_clamp() {
        let rect = Rect::new(10, 20, 101, 51);
        assert_eq!(rect.center(), Point::new(60.0, 45.0));

        let clamped = Rect::new(-10, -10, 50, 50).clamp_to(30, 100).unwrap();
        assert_eq!(clamped, Rect::new(0, 0, 30, 40));

        assert!(Rect::new(200, 200, 10, 10).clamp_to(100, 100).is_none());
    }

    #[test]
    fn test_crop_returns_clamped_region() {
        let frame = RgbImage::new(64, 48);
        let region = Rect::new(40, 30, 40, 40).crop(&frame).unwrap();
        assert_eq!(region.dimensions(), (24, 18));
    }

    #[test]
    fn test_geometry_with_and_without_eyes() {
        let eyes = [Rect::new(60, 40, 20, 20), Rect::new(20, 40, 20, 20)];
        let geometry = GeometricSummary::measure(100, 125, &eyes);
        assert_eq!(geometry.area, 12_500);
        assert!((geometry.aspect_ratio - 0.8).abs() < 1e-6);
        assert_eq!(geometry.eye_distance, Some(40.0));
        assert_eq!(geometry.eye_face_ratio, Some(0.4));

        let single = GeometricSummary::measure(100, 100, &eyes[..1]);
        assert!(single.eye_distance.is_none());
        let json = serde_json::to_value(&single).unwrap();
        assert!(json.get("eye_distance").is_none());
    }

    #[test]
    fn test_training_patch_is_square_gray() {
        let region = RgbImage::new(90, 120);
        let patch = training_patch(&region, 200);
        assert_eq!(patch.dimensions(), (200, 200));
    }
}
