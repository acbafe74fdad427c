use crate::vision::{Recognizer, VisionProvider};
use chrono::Local;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fixed name of the model file downstream consumers read
pub const LATEST_MODEL_FILE: &str = "latest_face_model.bin";

const MODEL_EXTENSION: &str = "bin";
const METADATA_PREFIX: &str = "model_metadata_";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Image encoding error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Verification failed for {path}: {reason}")]
    Verification { path: PathBuf, reason: String },
    #[error("No saved model found in {0}")]
    ModelNotFound(PathBuf),
}

/// Which training path produced a model; decides the archival file prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Trained,
    Simple,
}

impl ModelKind {
    fn prefix(&self) -> &'static str {
        match self {
            ModelKind::Trained => "face_recognizer_model",
            ModelKind::Simple => "simple_model",
        }
    }
}

/// Description of the training set a model was built from
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub training_samples: usize,
    pub user_id: i32,
    pub training_data_shape: String,
    pub labels_shape: String,
}

impl ModelInfo {
    pub fn describe(patches: &[GrayImage], labels: &[i32], user_id: i32) -> Self {
        let info = match patches.first() {
            Some(p) => Self::with_count(patches.len(), p.height(), p.width(), user_id),
            None => Self::with_count(0, 0, 0, user_id),
        };
        info.with_labels(labels.len())
    }

    /// Shape description for `samples` patches of `height` x `width`
    pub fn with_count(samples: usize, height: u32, width: u32, user_id: i32) -> Self {
        let training_data_shape = if samples == 0 {
            "(0,)".to_string()
        } else {
            format!("({}, {}, {})", samples, height, width)
        };

        Self {
            training_samples: samples,
            user_id,
            training_data_shape,
            labels_shape: format!("({},)", samples),
        }
    }

    fn with_labels(mut self, labels: usize) -> Self {
        self.labels_shape = format!("({},)", labels);
        self
    }
}

/// JSON sidecar written next to every archival model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub timestamp: String,
    pub model_path: PathBuf,
    pub model_filename: String,
    pub training_samples: usize,
    pub user_id: i32,
    pub model_type: String,
    pub training_data_shape: String,
    pub labels_shape: String,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct SavedModel {
    pub archive_path: PathBuf,
    /// `None` when the model was archived but not published as "latest"
    pub latest_path: Option<PathBuf>,
    /// `None` when the sidecar could not be written; the model itself is intact
    pub metadata_path: Option<PathBuf>,
    pub metadata: ModelMetadata,
}

/// Versioned on-disk model storage: timestamped archives plus one "latest" file
pub struct ModelStore {
    dir: PathBuf,
    verify: fn(&Path, &[u8]) -> Result<String, StorageError>,
}

impl ModelStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            verify,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_verifier(
        mut self,
        verify: fn(&Path, &[u8]) -> Result<String, StorageError>,
    ) -> Self {
        self.verify = verify;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_MODEL_FILE)
    }

    /// Serialize `model`, write and verify the archival copy, then publish it
    /// as "latest". Any failure before the publish leaves "latest" untouched.
    /// An untrained model is only published when there is no "latest" yet.
    pub fn save(
        &self,
        model: &dyn Recognizer,
        kind: ModelKind,
        info: &ModelInfo,
    ) -> Result<SavedModel, StorageError> {
        let bytes = model
            .to_bytes()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        ensure_private_dir(&self.dir)?;

        let timestamp = unique_timestamp(|stamp| {
            self.dir
                .join(format!("{}_{}.{}", kind.prefix(), stamp, MODEL_EXTENSION))
                .exists()
                || self.dir.join(format!("{}{}.json", METADATA_PREFIX, stamp)).exists()
        });
        let model_filename = format!("{}_{}.{}", kind.prefix(), timestamp, MODEL_EXTENSION);
        let archive_path = self.dir.join(&model_filename);

        write_atomic(&archive_path, &bytes)?;
        let sha256 = match (self.verify)(&archive_path, &bytes) {
            Ok(sha256) => sha256,
            Err(e) => {
                if let Err(remove) = fs::remove_file(&archive_path) {
                    log::warn!(
                        "Failed to remove unverified model {}: {}",
                        archive_path.display(),
                        remove
                    );
                }
                return Err(e);
            }
        };
        log::info!(
            "Model file created: {} ({} bytes)",
            archive_path.display(),
            bytes.len()
        );

        let metadata = ModelMetadata {
            timestamp: timestamp.clone(),
            model_path: archive_path.clone(),
            model_filename,
            training_samples: info.training_samples,
            user_id: info.user_id,
            model_type: model.model_type().to_string(),
            training_data_shape: info.training_data_shape.clone(),
            labels_shape: info.labels_shape.clone(),
            sha256,
        };

        let metadata_path = self.dir.join(format!("{}{}.json", METADATA_PREFIX, timestamp));
        let metadata_path = match write_json(&metadata_path, &metadata) {
            Ok(()) => {
                log::info!("Model metadata saved to: {}", metadata_path.display());
                Some(metadata_path)
            }
            Err(e) => {
                log::warn!("Failed to write model metadata {}: {}", metadata_path.display(), e);
                None
            }
        };

        let latest = self.latest_path();
        let latest_path = if model.is_trained() || !latest.is_file() {
            write_atomic(&latest, &bytes)?;
            log::info!("Latest model published: {}", latest.display());
            Some(latest)
        } else {
            log::warn!("Untrained model archived only; keeping {}", latest.display());
            None
        };

        Ok(SavedModel {
            archive_path,
            latest_path,
            metadata_path,
            metadata,
        })
    }

    /// Read a model file and rebuild it with the provider's classifier
    pub fn load(
        &self,
        path: &Path,
        vision: &dyn VisionProvider,
    ) -> Result<Arc<dyn Recognizer>, StorageError> {
        if !path.exists() {
            return Err(StorageError::ModelNotFound(path.to_path_buf()));
        }

        let bytes = fs::read(path)?;
        if bytes.is_empty() {
            return Err(StorageError::Verification {
                path: path.to_path_buf(),
                reason: "file is empty".to_string(),
            });
        }

        let model = vision
            .model_from_bytes(&bytes)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        log::info!("Model loaded from: {}", path.display());
        Ok(model)
    }

    /// The "latest" file when present, otherwise the newest archival model
    pub fn most_recent(&self) -> Option<PathBuf> {
        let latest = self.latest_path();
        if latest.is_file() {
            return Some(latest);
        }

        let entries = fs::read_dir(&self.dir).ok()?;
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(MODEL_EXTENSION))
            .filter_map(|p| {
                let modified = fs::metadata(&p).and_then(|m| m.modified()).ok()?;
                Some((modified, p))
            })
            .max()
            .map(|(_, p)| p)
    }

    /// All metadata sidecars, oldest first
    pub fn list(&self) -> Result<Vec<ModelMetadata>, StorageError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut models = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_sidecar = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(METADATA_PREFIX) && n.ends_with(".json"))
                .unwrap_or(false);
            if !is_sidecar {
                continue;
            }

            let contents = fs::read_to_string(&path)?;
            match serde_json::from_str::<ModelMetadata>(&contents) {
                Ok(metadata) => models.push(metadata),
                Err(e) => log::warn!("Skipping unreadable model metadata {}: {}", path.display(), e),
            }
        }

        models.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(models)
    }
}

/// Re-read a freshly written file and confirm it matches what was written
fn verify(path: &Path, expected: &[u8]) -> Result<String, StorageError> {
    let written = fs::read(path).map_err(|e| StorageError::Verification {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if written.is_empty() {
        return Err(StorageError::Verification {
            path: path.to_path_buf(),
            reason: "file is empty".to_string(),
        });
    }

    let digest = hex_digest(&written);
    if digest != hex_digest(expected) {
        return Err(StorageError::Verification {
            path: path.to_path_buf(),
            reason: "checksum mismatch".to_string(),
        });
    }

    Ok(digest)
}

/// Local timestamp with millisecond resolution, plus a counter suffix while
/// `taken` reports a collision
pub(crate) fn unique_timestamp<F: Fn(&str) -> bool>(taken: F) -> String {
    let base = Local::now().format("%Y%m%d_%H%M%S_%3f").to_string();
    if !taken(&base) {
        return base;
    }
    (1u32..)
        .map(|n| format!("{}_{}", base, n))
        .find(|stamp| !taken(stamp))
        .unwrap_or(base)
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Write through a temp file in the target directory and rename into place,
/// so readers never observe a partial file
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let contents =
        serde_json::to_vec_pretty(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
    write_atomic(path, &contents)?;
    Ok(())
}

/// Create a directory readable only by its owner
pub(crate) fn ensure_private_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        }
    }
    Ok(())
}
