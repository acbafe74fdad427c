use crate::vision::{Point, Rect};
use image::{imageops, RgbImage};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

const INPUT_SIZE: u32 = 640;

/// SCRFD uses 3 feature pyramid levels with different strides
const FEATURE_STRIDES: [usize; 3] = [8, 16, 32];
const NUM_ANCHORS: usize = 2;
const NMS_IOU_THRESHOLD: f32 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Nearest integer pixel rectangle
    pub fn to_rect(&self) -> Rect {
        Rect::new(
            self.x.round() as i32,
            self.y.round() as i32,
            self.width.max(0.0).round() as u32,
            self.height.max(0.0).round() as u32,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FacialLandmarks {
    pub left_eye: Point,
    pub right_eye: Point,
    pub nose: Point,
    pub left_mouth: Point,
    pub right_mouth: Point,
}

impl FacialLandmarks {
    fn scaled(&self, sx: f32, sy: f32) -> Self {
        let s = |p: Point| Point::new(p.x / sx, p.y / sy);
        Self {
            left_eye: s(self.left_eye),
            right_eye: s(self.right_eye),
            nose: s(self.nose),
            left_mouth: s(self.left_mouth),
            right_mouth: s(self.right_mouth),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub landmarks: FacialLandmarks,
    pub confidence: f32,
}

/// SCRFD face detector running on ONNX Runtime (CPU)
pub struct FaceDetector {
    session: Session,
    confidence_threshold: f32,
    min_face_size: u32,
}

impl FaceDetector {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        confidence_threshold: f32,
        min_face_size: u32,
    ) -> Result<Self, DetectionError> {
        let model_path = model_path.as_ref();

        let session = Session::builder()
            .map_err(|e| DetectionError::ModelLoad(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| DetectionError::ModelLoad(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| {
                DetectionError::ModelLoad(format!("Failed to load model from {:?}: {}", model_path, e))
            })?;

        log::info!("Loaded face detection model: {:?}", model_path);

        Ok(Self {
            session,
            confidence_threshold,
            min_face_size,
        })
    }

    /// Detect faces, strongest first. An image without faces yields an empty list.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, DetectionError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input_tensor, scale_x, scale_y) = preprocess(image);

        let input_value = Value::from_array(input_tensor)
            .map_err(|e| DetectionError::Inference(format!("Failed to create input tensor: {}", e)))?;

        let outputs = self
            .session
            .run(ort::inputs!["input.1" => input_value])
            .map_err(|e| DetectionError::Inference(e.to_string()))?;

        // Scores for the three strides come first, then boxes, then keypoints
        if outputs.len() != 9 {
            log::warn!("Expected 9 SCRFD outputs, got {}", outputs.len());
        }

        let mut detections = Vec::new();

        for (stride_idx, &stride) in FEATURE_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = (stride_idx, stride_idx + 3, stride_idx + 6);
            if kps_idx >= outputs.len() {
                log::warn!("Missing outputs for stride {}, skipping", stride);
                continue;
            }

            let (_, score_data) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectionError::Inference(format!("scores for stride {}: {}", stride, e)))?;
            let (_, bbox_data) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectionError::Inference(format!("boxes for stride {}: {}", stride, e)))?;
            let (_, kps_data) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectionError::Inference(format!("landmarks for stride {}: {}", stride, e)))?;

            let anchors = generate_anchors(stride, INPUT_SIZE as usize / stride);

            for (anchor_idx, &anchor) in anchors.iter().enumerate() {
                for anchor_num in 0..NUM_ANCHORS {
                    let idx = anchor_idx * NUM_ANCHORS + anchor_num;

                    let Some(&raw_score) = score_data.get(idx) else {
                        continue;
                    };
                    let score = 1.0 / (1.0 + (-raw_score).exp());
                    if score < self.confidence_threshold {
                        continue;
                    }

                    let (Some(bbox_pred), Some(kps_pred)) = (
                        bbox_data.get(idx * 4..idx * 4 + 4),
                        kps_data.get(idx * 10..idx * 10 + 10),
                    ) else {
                        continue;
                    };

                    let (x, y, w, h) = decode_bbox(anchor, bbox_pred);
                    let bbox = BoundingBox {
                        x: x / scale_x,
                        y: y / scale_y,
                        width: w / scale_x,
                        height: h / scale_y,
                    };

                    if bbox.width < self.min_face_size as f32 || bbox.height < self.min_face_size as f32 {
                        log::trace!("Dropping small face {:.0}x{:.0}", bbox.width, bbox.height);
                        continue;
                    }

                    detections.push(DetectedFace {
                        bbox,
                        landmarks: decode_landmarks(anchor, kps_pred, stride as f32).scaled(scale_x, scale_y),
                        confidence: score,
                    });
                }
            }
        }

        log::debug!("Found {} detections before NMS", detections.len());
        Ok(nms(detections, NMS_IOU_THRESHOLD))
    }
}

/// Anchor centers for one stride
fn generate_anchors(stride: usize, feat_size: usize) -> Vec<(f32, f32)> {
    let mut anchors = Vec::with_capacity(feat_size * feat_size);
    for i in 0..feat_size {
        for j in 0..feat_size {
            let cx = (j as f32 + 0.5) * stride as f32;
            let cy = (i as f32 + 0.5) * stride as f32;
            anchors.push((cx, cy));
        }
    }
    anchors
}

/// Box distances are relative to the anchor center, without stride scaling
fn decode_bbox(anchor: (f32, f32), pred: &[f32]) -> (f32, f32, f32, f32) {
    let (cx, cy) = anchor;
    let x1 = cx - pred[0].abs();
    let y1 = cy - pred[1].abs();
    let x2 = cx + pred[2].abs();
    let y2 = cy + pred[3].abs();
    (x1, y1, x2 - x1, y2 - y1)
}

fn decode_landmarks(anchor: (f32, f32), pred: &[f32], stride: f32) -> FacialLandmarks {
    let (cx, cy) = anchor;
    let p = |i: usize| Point::new(cx + pred[i] * stride, cy + pred[i + 1] * stride);
    FacialLandmarks {
        left_eye: p(0),
        right_eye: p(2),
        nose: p(4),
        left_mouth: p(6),
        right_mouth: p(8),
    }
}

/// Resize to the network input and lay out as NCHW floats in [0, 1]
fn preprocess(image: &RgbImage) -> (([usize; 4], Vec<f32>), f32, f32) {
    let (orig_width, orig_height) = image.dimensions();
    let resized = imageops::resize(image, INPUT_SIZE, INPUT_SIZE, imageops::FilterType::Triangle);

    let scale_x = INPUT_SIZE as f32 / orig_width as f32;
    let scale_y = INPUT_SIZE as f32 / orig_height as f32;

    let mut input_data = Vec::with_capacity((INPUT_SIZE * INPUT_SIZE * 3) as usize);
    for c in 0..3 {
        for y in 0..INPUT_SIZE {
            for x in 0..INPUT_SIZE {
                input_data.push(resized.get_pixel(x, y)[c] as f32 / 255.0);
            }
        }
    }

    let shape = [1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize];
    ((shape, input_data), scale_x, scale_y)
}

/// Non-maximum suppression; output is sorted by confidence, highest first
fn nms(mut detections: Vec<DetectedFace>, iou_threshold: f32) -> Vec<DetectedFace> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<DetectedFace> = Vec::new();
    for detection in detections {
        if keep.iter().all(|k| k.bbox.iou(&detection.bbox) <= iou_threshold) {
            keep.push(detection);
        }
    }
    keep
}
