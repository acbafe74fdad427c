//! Login session state machine.
//!
//! One `LoginSession` is driven by ticks: each tick carries the best face in
//! the current frame (or none) and moves the session through
//! `Idle -> FaceDetected -> StableScanning -> LoginSuccessful`. A face that
//! disappears briefly parks the session in `FaceLostGrace` instead of
//! dropping it back to `Idle`.

use crate::config::{Config, SessionConfig};
use crate::quality;
use crate::record::{EnrollmentCapture, EnrollmentStore, SavedRecord};
use crate::stability::StabilityTracker;
use crate::store::{ModelInfo, ModelKind, ModelStore, SavedModel, StorageError};
use crate::training::{
    publish_minimal_model, publish_simple_model, train_and_publish, Observation, SampleAccumulator,
    TrainingError, TrainingPolicy,
};
use crate::vision::{
    select_best, training_patch, FaceCandidate, Prediction, Rect, Recognizer, VisionError,
    VisionProvider,
};
use image::RgbImage;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const STATUS_LOOKING: &str = "Looking for Face...";
pub const STATUS_DETECTED: &str = "FACE DETECTED - Hold Still";
pub const STATUS_STABLE: &str = "FACE STABLE - Scanning...";
pub const STATUS_SUCCESS: &str = "Login Successful!";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No face is currently in view")]
    NoFace,
    #[error("No saved model found")]
    NoModel,
    #[error("Training error: {0}")]
    Training(#[from] TrainingError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    FaceDetected,
    StableScanning,
    FaceLostGrace,
    LoginSuccessful,
}

/// Session bookkeeping; every field exists from construction
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub phase: Phase,
    pub detection_start: Option<Instant>,
    pub face_lost_since: Option<Instant>,
    /// Goes false -> true once; only `reset` clears it
    pub login_successful: bool,
    pub face_count: usize,
    pub last_quality: Option<f32>,
    pub last_prediction: Option<Prediction>,
}

/// The best face of one frame, already scored
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub rect: Rect,
    pub confidence: f32,
    pub region: RgbImage,
    pub quality: f32,
    pub prediction: Option<Prediction>,
}

#[derive(Debug, Clone)]
pub struct LoginReport {
    pub elapsed: Duration,
    pub record: Option<SavedRecord>,
    pub model: Option<SavedModel>,
    pub training_samples: usize,
}

#[derive(Debug, Clone)]
pub enum TickOutcome {
    Searching,
    Tracking { elapsed: Duration, stable: bool },
    Grace { lost_for: Duration },
    /// Returned exactly once, on the tick that completes the login
    LoginCompleted(LoginReport),
    /// The session already completed; ticks are ignored until a reset
    Finished,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub face_count: usize,
    pub status_text: &'static str,
    pub phase: Phase,
    pub login_successful: bool,
    pub quality: Option<f32>,
    pub stable_frames: u32,
    pub required_stable_frames: u32,
    pub elapsed_secs: Option<f64>,
    pub training_samples: usize,
    pub model_trained: bool,
    pub last_prediction: Option<Prediction>,
}

pub struct LoginSession {
    config: SessionConfig,
    forced_sample_count: usize,
    patch_size: u32,
    vision: Box<dyn VisionProvider>,
    models: ModelStore,
    records: EnrollmentStore,
    tracker: StabilityTracker,
    samples: SampleAccumulator,
    policy: TrainingPolicy,
    recognizer: Option<Arc<dyn Recognizer>>,
    state: SessionState,
    current_face: Option<FaceObservation>,
}

impl LoginSession {
    pub fn new(config: &Config, vision: Box<dyn VisionProvider>) -> Self {
        let session = &config.session;
        Self {
            config: session.clone(),
            forced_sample_count: config.training.forced_sample_count,
            patch_size: config.training.patch_size,
            vision,
            models: ModelStore::new(&config.storage.models_dir),
            records: EnrollmentStore::new(&config.storage.images_dir, &config.storage.records_dir),
            tracker: StabilityTracker::new(
                session.stability_threshold_px,
                session.required_stable_frames,
                session.instability_penalty,
            ),
            samples: SampleAccumulator::new(&config.training),
            policy: TrainingPolicy::new(&config.training),
            recognizer: None,
            state: SessionState::default(),
            current_face: None,
        }
    }

    /// Faces in `frame` as the session's vision provider sees them
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<FaceCandidate>, VisionError> {
        self.vision.detect_faces(frame)
    }

    /// Detect, score and advance on one frame
    pub fn tick(&mut self, frame: &RgbImage, now: Instant) -> TickOutcome {
        if self.state.login_successful {
            return TickOutcome::Finished;
        }

        let faces = match self.vision.detect_faces(frame) {
            Ok(faces) => faces,
            Err(e) => {
                log::debug!("Face detection failed, treating frame as empty: {}", e);
                Vec::new()
            }
        };

        let observation = select_best(&faces, self.vision.reports_confidence()).and_then(|best| {
            let rect = best.rect.clamp_to(frame.width(), frame.height())?;
            let region = rect.crop(frame)?;
            let quality = quality::score(&region);
            let prediction = self.predict(&region);
            Some(FaceObservation {
                rect,
                confidence: best.confidence,
                region,
                quality,
                prediction,
            })
        });

        self.advance(observation, faces.len(), now)
    }

    /// Apply one tick's observation to the state machine
    pub fn advance(
        &mut self,
        observation: Option<FaceObservation>,
        face_count: usize,
        now: Instant,
    ) -> TickOutcome {
        if self.state.login_successful {
            return TickOutcome::Finished;
        }
        self.state.face_count = face_count;

        let Some(face) = observation else {
            return self.face_missing(now);
        };

        self.state.face_lost_since = None;
        self.state.last_quality = Some(face.quality);
        self.state.last_prediction = face.prediction;

        self.tracker.update(face.rect.center());
        let stable = self.tracker.is_stable();

        let start = *self.state.detection_start.get_or_insert_with(|| {
            log::info!("Face detected! Hold still for login...");
            now
        });
        let elapsed = now.saturating_duration_since(start);

        self.samples.observe(&Observation {
            rect: face.rect,
            region: face.region.clone(),
            quality: face.quality,
            captured_at: now,
        });

        if self.policy.should_train(self.samples.sample_count(), self.model_trained()) {
            self.train_opportunistically();
        }

        if elapsed >= self.config.required_dwell() && face.quality > self.config.completion_quality {
            return TickOutcome::LoginCompleted(self.complete_login(face, elapsed));
        }

        self.state.phase = if stable {
            Phase::StableScanning
        } else {
            Phase::FaceDetected
        };
        self.current_face = Some(face);

        TickOutcome::Tracking { elapsed, stable }
    }

    fn face_missing(&mut self, now: Instant) -> TickOutcome {
        self.state.last_quality = None;
        self.state.last_prediction = None;
        self.current_face = None;

        if self.state.detection_start.is_none() {
            self.state.phase = Phase::Idle;
            return TickOutcome::Searching;
        }

        let since = *self.state.face_lost_since.get_or_insert(now);
        let lost_for = now.saturating_duration_since(since);

        if lost_for > self.config.face_lost_grace() {
            log::info!("Face lost! Please position yourself properly.");
            self.state.phase = Phase::Idle;
            self.state.detection_start = None;
            self.state.face_lost_since = None;
            self.tracker.reset();
            return TickOutcome::Searching;
        }

        self.state.phase = Phase::FaceLostGrace;
        TickOutcome::Grace { lost_for }
    }

    fn complete_login(&mut self, face: FaceObservation, elapsed: Duration) -> LoginReport {
        self.state.login_successful = true;
        self.state.phase = Phase::LoginSuccessful;
        log::info!("LOGIN SUCCESSFUL after {:.1}s", elapsed.as_secs_f64());

        let (region, rect, quality) = match self.samples.best_observation() {
            Some(best) => (best.region.clone(), best.rect, best.quality),
            None => (face.region.clone(), face.rect, face.quality),
        };

        let capture = EnrollmentCapture {
            region: &region,
            rect,
            quality,
            stability_frames: self.tracker.stable_count(),
        };
        let features = self.vision.extract_features(&region);
        let record = match self.records.save(&capture, features) {
            Ok(record) => Some(record),
            Err(e) => {
                log::error!("Failed to save enrollment record: {}", e);
                None
            }
        };

        let padded = self.samples.pad_to(self.forced_sample_count, &region);
        if padded > 0 {
            log::info!("Padded training set with {} copies of the best face", padded);
        }
        let training_samples = self.samples.sample_count();
        let model = self.forced_training();

        self.current_face = Some(face);

        LoginReport {
            elapsed,
            record,
            model,
            training_samples,
        }
    }

    /// Train on the (padded) samples; on failure retry through the simple
    /// model path. When both fail nothing is written and "latest" keeps the
    /// last successfully trained model.
    fn forced_training(&mut self) -> Option<SavedModel> {
        match train_and_publish(self.vision.as_ref(), &self.models, &self.samples) {
            Ok(trained) => {
                self.recognizer = Some(trained.recognizer);
                return Some(trained.saved);
            }
            Err(e) => log::warn!("Model training failed, trying simple model: {}", e),
        }

        match publish_simple_model(self.vision.as_ref(), &self.models, &self.samples) {
            Ok(simple) => {
                if simple.recognizer.is_trained() {
                    self.recognizer = Some(simple.recognizer);
                }
                Some(simple.saved)
            }
            Err(e) => {
                log::error!("Simple model could not be trained or saved: {}", e);
                None
            }
        }
    }

    fn train_opportunistically(&mut self) {
        log::info!("Training model with {} collected samples", self.samples.sample_count());
        match train_and_publish(self.vision.as_ref(), &self.models, &self.samples) {
            Ok(trained) => self.recognizer = Some(trained.recognizer),
            Err(e) => log::warn!("Opportunistic training failed: {}", e),
        }
    }

    fn predict(&self, region: &RgbImage) -> Option<Prediction> {
        let recognizer = self.recognizer.as_ref().filter(|r| r.is_trained())?;
        match recognizer.predict(&training_patch(region, self.patch_size)) {
            Ok(prediction) => Some(prediction),
            Err(e) => {
                log::debug!("Prediction failed: {}", e);
                None
            }
        }
    }

    fn model_trained(&self) -> bool {
        self.recognizer.as_ref().map(|r| r.is_trained()).unwrap_or(false)
    }

    /// Back to `Idle` with no samples. Persisted records and models, and the
    /// loaded recognizer, are kept.
    pub fn reset(&mut self) {
        self.state = SessionState::default();
        self.tracker.reset();
        self.samples.clear();
        self.policy.reset();
        self.current_face = None;
        log::info!("System reset!");
    }

    /// Train now on whatever samples have been collected
    pub fn force_train(&mut self) -> Result<SavedModel, SessionError> {
        let trained = train_and_publish(self.vision.as_ref(), &self.models, &self.samples)?;
        self.recognizer = Some(trained.recognizer);
        Ok(trained.saved)
    }

    /// Persist the current model. Without collected samples this re-saves
    /// the recognizer in memory; with samples it trains first.
    pub fn force_save(&mut self) -> Result<SavedModel, SessionError> {
        if self.samples.sample_count() > 0 {
            return self.force_train();
        }

        let recognizer = self.recognizer.as_ref().ok_or(SessionError::NoModel)?;
        let info = ModelInfo::with_count(
            recognizer.sample_count(),
            self.patch_size,
            self.patch_size,
            self.samples.label(),
        );
        Ok(self.models.save(&**recognizer, ModelKind::Trained, &info)?)
    }

    /// Rebuild the training set from copies of the face currently in view
    /// and train on it
    pub fn force_minimal_model(&mut self) -> Result<SavedModel, SessionError> {
        let face = self.current_face.as_ref().ok_or(SessionError::NoFace)?;
        let trained = publish_minimal_model(
            self.vision.as_ref(),
            &self.models,
            &mut self.samples,
            &face.region,
            self.forced_sample_count,
        )?;
        self.recognizer = Some(trained.recognizer);
        Ok(trained.saved)
    }

    /// Load the most recent model from disk and make it current
    pub fn load_latest_model(&mut self) -> Result<PathBuf, SessionError> {
        let path = self.models.most_recent().ok_or(SessionError::NoModel)?;
        let model = self.models.load(&path, self.vision.as_ref())?;
        self.recognizer = Some(model);
        Ok(path)
    }

    pub fn status_text(&self) -> &'static str {
        match self.state.phase {
            Phase::Idle => STATUS_LOOKING,
            Phase::LoginSuccessful => STATUS_SUCCESS,
            Phase::FaceDetected | Phase::StableScanning | Phase::FaceLostGrace => {
                if self.tracker.is_stable() {
                    STATUS_STABLE
                } else {
                    STATUS_DETECTED
                }
            }
        }
    }

    pub fn status(&self, now: Instant) -> SessionStatus {
        SessionStatus {
            face_count: self.state.face_count,
            status_text: self.status_text(),
            phase: self.state.phase,
            login_successful: self.state.login_successful,
            quality: self.state.last_quality,
            stable_frames: self.tracker.stable_count(),
            required_stable_frames: self.tracker.required_frames(),
            elapsed_secs: self
                .state
                .detection_start
                .map(|start| now.saturating_duration_since(start).as_secs_f64()),
            training_samples: self.samples.sample_count(),
            model_trained: self.model_trained(),
            last_prediction: self.state.last_prediction,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state.login_successful
    }

    pub fn recognizer(&self) -> Option<&Arc<dyn Recognizer>> {
        self.recognizer.as_ref()
    }
}
