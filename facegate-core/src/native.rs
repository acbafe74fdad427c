//! Vision provider built from the SCRFD detector, FAST keypoints and LBPH.

use crate::config::DetectionConfig;
use crate::detect::FaceDetector;
use crate::lbph::{lbp_histogram, LbphParams, LbphRecognizer};
use crate::vision::{
    FaceCandidate, FeatureSet, GeometricSummary, Point, Rect, Recognizer, VisionError, VisionProvider,
};
use image::{imageops, GrayImage, RgbImage};
use imageproc::corners::corners_fast9;
use std::sync::Arc;

const MAX_KEYPOINTS: usize = 500;
const FAST_THRESHOLD: u8 = 20;
/// Eye box side relative to the face width
const EYE_BOX_RATIO: f32 = 0.2;

pub struct NativeVision {
    detector: Option<FaceDetector>,
    params: LbphParams,
}

impl NativeVision {
    /// Load the detector; a missing or broken model leaves detection
    /// unavailable while features and training keep working
    pub fn new(config: &DetectionConfig) -> Self {
        if !config.model_path.is_file() {
            log::warn!(
                "Face detection unavailable: model not found at {}",
                config.model_path.display()
            );
            return Self::without_detector();
        }

        let detector = match FaceDetector::new(
            &config.model_path,
            config.confidence_threshold,
            config.min_face_size,
        ) {
            Ok(detector) => Some(detector),
            Err(e) => {
                log::warn!("Face detection unavailable: {}", e);
                None
            }
        };

        Self {
            detector,
            params: LbphParams::default(),
        }
    }

    pub fn without_detector() -> Self {
        Self {
            detector: None,
            params: LbphParams::default(),
        }
    }

    pub fn has_detector(&self) -> bool {
        self.detector.is_some()
    }

    fn detector(&mut self) -> Result<&mut FaceDetector, VisionError> {
        self.detector
            .as_mut()
            .ok_or_else(|| VisionError::Unavailable("no face detection model loaded".to_string()))
    }
}

impl VisionProvider for NativeVision {
    fn reports_confidence(&self) -> bool {
        true
    }

    fn detect_faces(&mut self, frame: &RgbImage) -> Result<Vec<FaceCandidate>, VisionError> {
        let faces = self
            .detector()?
            .detect(frame)
            .map_err(|e| VisionError::Detection(e.to_string()))?;

        Ok(faces
            .iter()
            .map(|f| FaceCandidate {
                rect: f.bbox.to_rect(),
                confidence: f.confidence,
            })
            .collect())
    }

    /// Eye boxes centered on the detector's eye landmarks
    fn detect_eyes(&mut self, region: &RgbImage) -> Result<Vec<Rect>, VisionError> {
        let faces = self
            .detector()?
            .detect(region)
            .map_err(|e| VisionError::Detection(e.to_string()))?;

        let Some(face) = faces.first() else {
            return Ok(Vec::new());
        };

        let side = (face.bbox.width * EYE_BOX_RATIO).max(1.0);
        let eye_box = |p: Point| {
            Rect::new(
                (p.x - side / 2.0).round() as i32,
                (p.y - side / 2.0).round() as i32,
                side.round() as u32,
                side.round() as u32,
            )
        };

        Ok(vec![eye_box(face.landmarks.left_eye), eye_box(face.landmarks.right_eye)])
    }

    fn extract_features(&mut self, region: &RgbImage) -> Result<FeatureSet, VisionError> {
        let (width, height) = region.dimensions();
        if width == 0 || height == 0 {
            return Err(VisionError::Features("empty face region".to_string()));
        }

        let gray = imageops::grayscale(region);
        let keypoints = keypoint_descriptors(&gray);

        let eyes = match self.detect_eyes(region) {
            Ok(eyes) => eyes,
            Err(e) => {
                log::debug!("Eye detection skipped: {}", e);
                Vec::new()
            }
        };

        Ok(FeatureSet {
            primary_descriptors: (!keypoints.is_empty()).then_some(keypoints),
            secondary_descriptors: None,
            lbp_histogram: Some(lbp_histogram(&gray)),
            geometry: Some(GeometricSummary::measure(width, height, &eyes)),
        })
    }

    fn train(&self, patches: &[GrayImage], labels: &[i32]) -> Result<Arc<dyn Recognizer>, VisionError> {
        Ok(Arc::new(LbphRecognizer::train(patches, labels, self.params)?))
    }

    fn empty_model(&self) -> Arc<dyn Recognizer> {
        Arc::new(LbphRecognizer::empty(self.params))
    }

    fn model_from_bytes(&self, bytes: &[u8]) -> Result<Arc<dyn Recognizer>, VisionError> {
        Ok(Arc::new(LbphRecognizer::from_bytes(bytes)?))
    }
}

/// Strongest FAST-9 corners as `[x, y, score]` rows
fn keypoint_descriptors(gray: &GrayImage) -> Vec<Vec<f32>> {
    let mut corners = corners_fast9(gray, FAST_THRESHOLD);
    corners.sort_by(|a, b| b.score.total_cmp(&a.score));
    corners.truncate(MAX_KEYPOINTS);
    corners
        .into_iter()
        .map(|c| vec![c.x as f32, c.y as f32, c.score])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{textured_frame, textured_patch};
    use image::Rgb;

    #[test]
    fn test_detection_unavailable_without_model() {
        let mut vision = NativeVision::without_detector();
        assert!(!vision.has_detector());
        assert!(matches!(
            vision.detect_faces(&RgbImage::new(64, 64)),
            Err(VisionError::Unavailable(_))
        ));
    }

    #[test]
    fn test_features_from_textured_region() {
        let mut vision = NativeVision::without_detector();
        let region = textured_frame(80, 100, 4);
        let features = vision.extract_features(&region).unwrap();

        let keypoints = features.primary_descriptors.unwrap();
        assert!(!keypoints.is_empty() && keypoints.len() <= MAX_KEYPOINTS);
        assert!(keypoints.iter().all(|k| k.len() == 3));
        assert!(keypoints.windows(2).all(|w| w[0][2] >= w[1][2]));

        assert!(features.secondary_descriptors.is_none());
        assert_eq!(features.lbp_histogram.unwrap().iter().sum::<u32>(), 80 * 100);

        let geometry = features.geometry.unwrap();
        assert_eq!((geometry.face_width, geometry.face_height), (80, 100));
        assert!(geometry.eye_distance.is_none());
    }

    #[test]
    fn test_flat_region_has_no_keypoints() {
        let mut vision = NativeVision::without_detector();
        let region = RgbImage::from_pixel(40, 40, Rgb([90, 90, 90]));
        let features = vision.extract_features(&region).unwrap();
        assert!(features.primary_descriptors.is_none());
        assert!(features.lbp_histogram.is_some());

        assert!(vision.extract_features(&RgbImage::new(0, 0)).is_err());
    }

    #[test]
    fn test_train_and_restore() {
        let vision = NativeVision::without_detector();
        let patches = vec![textured_patch(64, 1), textured_patch(64, 2)];
        let model = vision.train(&patches, &[1, 1]).unwrap();
        let restored = vision.model_from_bytes(&model.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.sample_count(), 2);
        assert_eq!(restored.model_type(), "LBPH_Face_Recognizer");
        assert!(!vision.empty_model().is_trained());
    }
}
