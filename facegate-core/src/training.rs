use crate::config::TrainingConfig;
use crate::store::{ModelInfo, ModelKind, ModelStore, SavedModel, StorageError};
use crate::vision::{training_patch, Rect, Recognizer, VisionError, VisionProvider};
use image::{GrayImage, RgbImage};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("No training samples available")]
    NoSamples,
    #[error("Classifier training failed: {0}")]
    Vision(#[from] VisionError),
    #[error("Failed to persist model: {0}")]
    Storage(#[from] StorageError),
}

/// One face region seen during the session
#[derive(Debug, Clone)]
pub struct Observation {
    pub rect: Rect,
    pub region: RgbImage,
    pub quality: f32,
    pub captured_at: Instant,
}

/// Bounded buffer of face observations plus the training patches derived
/// from them. Observations are capped; training patches are not.
pub struct SampleAccumulator {
    acceptance_quality: f32,
    max_observations: usize,
    patch_size: u32,
    label: i32,
    observations: Vec<Observation>,
    patches: Vec<GrayImage>,
    labels: Vec<i32>,
}

impl SampleAccumulator {
    pub fn new(config: &TrainingConfig) -> Self {
        Self {
            acceptance_quality: config.acceptance_quality,
            max_observations: config.max_observations,
            patch_size: config.patch_size,
            label: config.subject_label,
            observations: Vec::new(),
            patches: Vec::new(),
            labels: Vec::new(),
        }
    }

    /// Record an observation and report whether it also became a training
    /// sample. Observations stop being recorded once the buffer is full;
    /// only those with quality strictly above the floor are trained on.
    pub fn observe(&mut self, observation: &Observation) -> bool {
        if self.observations.len() >= self.max_observations {
            return false;
        }
        self.observations.push(observation.clone());

        if observation.quality <= self.acceptance_quality {
            return false;
        }

        self.add_sample(&observation.region);
        log::debug!(
            "Training data collected: {} samples (quality {:.2})",
            self.patches.len(),
            observation.quality
        );
        true
    }

    /// Append one training patch built from `region` with the subject label
    pub fn add_sample(&mut self, region: &RgbImage) {
        self.patches.push(training_patch(region, self.patch_size));
        self.labels.push(self.label);
    }

    /// Top up the training set with copies of `region` until it holds at
    /// least `target` samples; returns how many were added
    pub fn pad_to(&mut self, target: usize, region: &RgbImage) -> usize {
        let missing = target.saturating_sub(self.patches.len());
        if missing > 0 {
            let patch = training_patch(region, self.patch_size);
            self.patches.extend(std::iter::repeat(patch).take(missing));
            self.labels.extend(std::iter::repeat(self.label).take(missing));
        }
        missing
    }

    /// Highest-quality observation; ties keep the earliest
    pub fn best_observation(&self) -> Option<&Observation> {
        self.observations.iter().fold(None, |best: Option<&Observation>, o| match best {
            Some(b) if b.quality >= o.quality => Some(b),
            _ => Some(o),
        })
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn patches(&self) -> &[GrayImage] {
        &self.patches
    }

    pub fn labels(&self) -> &[i32] {
        &self.labels
    }

    pub fn sample_count(&self) -> usize {
        self.patches.len()
    }

    pub fn label(&self) -> i32 {
        self.label
    }

    pub fn clear(&mut self) {
        self.observations.clear();
        self.patches.clear();
        self.labels.clear();
    }
}

/// Decides when an opportunistic training attempt should run
pub struct TrainingPolicy {
    min_samples: usize,
    interval: u64,
    eligible_ticks: u64,
}

impl TrainingPolicy {
    pub fn new(config: &TrainingConfig) -> Self {
        Self {
            min_samples: config.min_samples,
            interval: config.training_interval_ticks.max(1),
            eligible_ticks: 0,
        }
    }

    /// Count a tick in which training would be allowed and report whether
    /// this is one of the ticks that should actually train
    pub fn should_train(&mut self, sample_count: usize, model_trained: bool) -> bool {
        if model_trained || sample_count < self.min_samples {
            return false;
        }
        self.eligible_ticks += 1;
        self.eligible_ticks % self.interval == 0
    }

    pub fn reset(&mut self) {
        self.eligible_ticks = 0;
    }
}

/// A model that has been trained and durably published
pub struct TrainedModel {
    pub recognizer: Arc<dyn Recognizer>,
    pub saved: SavedModel,
}

/// Train on everything the accumulator holds and publish the result
pub fn train_and_publish(
    vision: &dyn VisionProvider,
    store: &ModelStore,
    samples: &SampleAccumulator,
) -> Result<TrainedModel, TrainingError> {
    if samples.sample_count() == 0 {
        return Err(TrainingError::NoSamples);
    }

    log::info!("Training model with {} samples", samples.sample_count());
    let recognizer = vision.train(samples.patches(), samples.labels())?;
    let info = ModelInfo::describe(samples.patches(), samples.labels(), samples.label());
    let saved = store.save(recognizer.as_ref(), ModelKind::Trained, &info)?;

    Ok(TrainedModel { recognizer, saved })
}

/// Last-resort model under the simple-model prefix: trained on whatever
/// samples exist, or a deliberately empty one when there are none. A failed
/// training run is returned as an error and writes nothing.
pub fn publish_simple_model(
    vision: &dyn VisionProvider,
    store: &ModelStore,
    samples: &SampleAccumulator,
) -> Result<TrainedModel, TrainingError> {
    let recognizer = match samples.sample_count() {
        0 => vision.empty_model(),
        _ => vision.train(samples.patches(), samples.labels())?,
    };
    let info = ModelInfo::describe(samples.patches(), samples.labels(), samples.label());

    let saved = store.save(recognizer.as_ref(), ModelKind::Simple, &info)?;
    Ok(TrainedModel { recognizer, saved })
}

/// Train a minimal model from `copies` copies of a single region,
/// replacing whatever samples were collected before
pub fn publish_minimal_model(
    vision: &dyn VisionProvider,
    store: &ModelStore,
    samples: &mut SampleAccumulator,
    region: &RgbImage,
    copies: usize,
) -> Result<TrainedModel, TrainingError> {
    samples.clear();
    samples.pad_to(copies.max(1), region);
    train_and_publish(vision, store, samples)
}
