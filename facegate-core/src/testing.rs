//! Deterministic fixtures shared by the unit tests.

use crate::capture::CaptureError;
use crate::lbph::{LbphParams, LbphRecognizer};
use crate::stream::{CameraBackend, CameraDevice};
use crate::vision::{FaceCandidate, FeatureSet, GeometricSummary, Prediction, Rect, Recognizer, VisionError, VisionProvider};
use image::{GrayImage, Luma, Rgb, RgbImage};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn lcg(state: &mut u32) -> u8 {
    *state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
    (*state >> 24) as u8
}

/// Pseudo-random texture; same seed, same image
pub fn textured_patch(size: u32, seed: u32) -> GrayImage {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    GrayImage::from_fn(size, size, |_, _| Luma([lcg(&mut state)]))
}

pub fn gradient_patch(size: u32) -> GrayImage {
    GrayImage::from_fn(size, size, |x, y| Luma([((x + y) * 255 / (2 * size.max(1))) as u8]))
}

/// A busy, mid-brightness color image that scores near 1.0 on quality
pub fn textured_frame(width: u32, height: u32, seed: u32) -> RgbImage {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(7);
    RgbImage::from_fn(width, height, |_, _| {
        let v = lcg(&mut state);
        Rgb([v, v, v])
    })
}

pub fn face(x: i32, y: i32, size: u32) -> FaceCandidate {
    FaceCandidate {
        rect: Rect::new(x, y, size, size),
        confidence: 0.9,
    }
}

/// Shared switches for a [`ScriptedVision`] that stay with the test after the
/// provider has been moved into a session
#[derive(Clone, Default)]
pub struct VisionProbe {
    faces: Arc<Mutex<Vec<FaceCandidate>>>,
    fail_detection: Arc<AtomicBool>,
    fail_features: Arc<AtomicBool>,
    fail_training: Arc<AtomicBool>,
    training_calls: Arc<Mutex<Vec<usize>>>,
}

impl VisionProbe {
    pub fn show(&self, faces: Vec<FaceCandidate>) {
        *self.faces.lock().unwrap() = faces;
    }

    pub fn hide(&self) {
        self.faces.lock().unwrap().clear();
    }

    pub fn fail_detection(&self, fail: bool) {
        self.fail_detection.store(fail, Ordering::SeqCst);
    }

    pub fn fail_features(&self, fail: bool) {
        self.fail_features.store(fail, Ordering::SeqCst);
    }

    pub fn fail_training(&self, fail: bool) {
        self.fail_training.store(fail, Ordering::SeqCst);
    }

    /// Sample count passed to every `train` call so far
    pub fn training_calls(&self) -> Vec<usize> {
        self.training_calls.lock().unwrap().clone()
    }
}

/// Vision provider whose detections are set by the test; training and
/// persistence go through the real LBPH classifier
pub struct ScriptedVision {
    probe: VisionProbe,
}

impl ScriptedVision {
    pub fn new() -> (Self, VisionProbe) {
        let probe = VisionProbe::default();
        (Self { probe: probe.clone() }, probe)
    }
}

impl VisionProvider for ScriptedVision {
    fn reports_confidence(&self) -> bool {
        true
    }

    fn detect_faces(&mut self, _frame: &RgbImage) -> Result<Vec<FaceCandidate>, VisionError> {
        if self.probe.fail_detection.load(Ordering::SeqCst) {
            return Err(VisionError::Detection("scripted failure".to_string()));
        }
        Ok(self.probe.faces.lock().unwrap().clone())
    }

    fn detect_eyes(&mut self, region: &RgbImage) -> Result<Vec<Rect>, VisionError> {
        let (w, h) = region.dimensions();
        let size = w / 5;
        Ok(vec![
            Rect::new((w / 4) as i32, (h / 3) as i32, size, size),
            Rect::new((w * 3 / 5) as i32, (h / 3) as i32, size, size),
        ])
    }

    fn extract_features(&mut self, region: &RgbImage) -> Result<FeatureSet, VisionError> {
        if self.probe.fail_features.load(Ordering::SeqCst) {
            return Err(VisionError::Features("scripted failure".to_string()));
        }
        let eyes = self.detect_eyes(region)?;
        Ok(FeatureSet {
            primary_descriptors: Some(vec![vec![1.0, 2.0, 3.0]]),
            secondary_descriptors: None,
            lbp_histogram: None,
            geometry: Some(GeometricSummary::measure(region.width(), region.height(), &eyes)),
        })
    }

    fn train(&self, patches: &[GrayImage], labels: &[i32]) -> Result<Arc<dyn Recognizer>, VisionError> {
        self.probe.training_calls.lock().unwrap().push(patches.len());
        if self.probe.fail_training.load(Ordering::SeqCst) {
            return Err(VisionError::Training("scripted failure".to_string()));
        }
        Ok(Arc::new(LbphRecognizer::train(patches, labels, LbphParams::default())?))
    }

    fn empty_model(&self) -> Arc<dyn Recognizer> {
        Arc::new(LbphRecognizer::empty(LbphParams::default()))
    }

    fn model_from_bytes(&self, bytes: &[u8]) -> Result<Arc<dyn Recognizer>, VisionError> {
        Ok(Arc::new(LbphRecognizer::from_bytes(bytes)?))
    }
}

/// A recognizer that cannot be serialized
pub struct BrokenRecognizer;

impl Recognizer for BrokenRecognizer {
    fn predict(&self, _patch: &GrayImage) -> Result<Prediction, VisionError> {
        Err(VisionError::NotTrained)
    }

    fn to_bytes(&self) -> Result<Vec<u8>, VisionError> {
        Err(VisionError::Serialization("broken".to_string()))
    }

    fn is_trained(&self) -> bool {
        true
    }

    fn sample_count(&self) -> usize {
        1
    }

    fn model_type(&self) -> &'static str {
        "Broken"
    }
}

/// In-memory camera. Every open yields a fresh device that returns
/// `frames_per_open` good frames (unbounded when `None`) and then fails.
pub struct FakeBackend {
    pub name: &'static str,
    pub openable: bool,
    pub frames_per_open: Option<usize>,
    pub opens: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub fn working(name: &'static str) -> Self {
        Self {
            name,
            openable: true,
            frames_per_open: None,
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn broken(name: &'static str) -> Self {
        Self {
            openable: false,
            ..Self::working(name)
        }
    }
}

impl CameraBackend for FakeBackend {
    fn name(&self) -> &str {
        self.name
    }

    fn open(&self) -> Result<Box<dyn CameraDevice>, CaptureError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.openable {
            return Err(CaptureError::DeviceOpen(format!("{} unavailable", self.name)));
        }
        Ok(Box::new(FakeDevice {
            remaining: self.frames_per_open,
            seed: 0,
        }))
    }
}

struct FakeDevice {
    remaining: Option<usize>,
    seed: u32,
}

impl CameraDevice for FakeDevice {
    fn read_frame(&mut self) -> Result<RgbImage, CaptureError> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                std::thread::sleep(std::time::Duration::from_millis(1));
                return Err(CaptureError::Capture("fake device exhausted".to_string()));
            }
            *remaining -= 1;
        }
        self.seed += 1;
        std::thread::sleep(std::time::Duration::from_millis(2));
        Ok(textured_frame(32, 24, self.seed))
    }
}
