//! Enrollment records: a face snapshot plus a JSON document describing it.

use crate::store::{ensure_private_dir, unique_timestamp, write_atomic, write_json, StorageError};
use crate::vision::{FeatureSet, Rect, VisionError};
use image::{DynamicImage, ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub timestamp: String,
    pub face_image_path: PathBuf,
    pub face_image_filename: String,
    pub face_rectangle: Rect,
    pub features: FeatureSet,
    pub quality_score: f32,
    pub stability_frames: u32,
}

/// Written instead of a full record when the snapshot or the features could
/// not be produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradedRecord {
    pub timestamp: String,
    pub face_image_path: PathBuf,
    pub face_image_filename: String,
    pub face_rectangle: Rect,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordDocument {
    Complete(EnrollmentRecord),
    Degraded(DegradedRecord),
}

impl RecordDocument {
    pub fn is_complete(&self) -> bool {
        matches!(self, RecordDocument::Complete(_))
    }

    pub fn timestamp(&self) -> &str {
        match self {
            RecordDocument::Complete(r) => &r.timestamp,
            RecordDocument::Degraded(r) => &r.timestamp,
        }
    }

    fn degrade(self, error: String) -> Self {
        match self {
            RecordDocument::Complete(r) => RecordDocument::Degraded(DegradedRecord {
                timestamp: r.timestamp,
                face_image_path: r.face_image_path,
                face_image_filename: r.face_image_filename,
                face_rectangle: r.face_rectangle,
                error,
            }),
            degraded => degraded,
        }
    }
}

/// What the session hands over when a login completes
pub struct EnrollmentCapture<'a> {
    pub region: &'a RgbImage,
    pub rect: Rect,
    pub quality: f32,
    pub stability_frames: u32,
}

#[derive(Debug, Clone)]
pub struct SavedRecord {
    pub record_path: PathBuf,
    pub document: RecordDocument,
}

pub struct EnrollmentStore {
    images_dir: PathBuf,
    records_dir: PathBuf,
}

impl EnrollmentStore {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(images_dir: P, records_dir: Q) -> Self {
        Self {
            images_dir: images_dir.as_ref().to_path_buf(),
            records_dir: records_dir.as_ref().to_path_buf(),
        }
    }

    /// Write the snapshot and its record. A failed snapshot or feature
    /// extraction still produces a (degraded) record; only a record that
    /// cannot be written at all is an error.
    pub fn save(
        &self,
        capture: &EnrollmentCapture<'_>,
        features: Result<FeatureSet, VisionError>,
    ) -> Result<SavedRecord, StorageError> {
        ensure_private_dir(&self.records_dir)?;

        let timestamp = unique_timestamp(|stamp| {
            self.records_dir.join(format!("user_face_{}.json", stamp)).exists()
                || self.images_dir.join(format!("face_snapshot_{}.jpg", stamp)).exists()
        });
        let face_image_filename = format!("face_snapshot_{}.jpg", timestamp);
        let face_image_path = self.images_dir.join(&face_image_filename);

        let snapshot = ensure_private_dir(&self.images_dir)
            .map_err(StorageError::from)
            .and_then(|_| write_jpeg(&face_image_path, capture.region));

        let outcome = match (snapshot, features) {
            (Ok(()), Ok(features)) => Ok(features),
            (Err(e), _) => Err(format!("failed to save face image: {}", e)),
            (Ok(()), Err(e)) => Err(format!("feature extraction failed: {}", e)),
        };

        let document = match outcome {
            Ok(features) => {
                log::info!("Face image saved to: {}", face_image_path.display());
                RecordDocument::Complete(EnrollmentRecord {
                    timestamp: timestamp.clone(),
                    face_image_path,
                    face_image_filename,
                    face_rectangle: capture.rect,
                    features,
                    quality_score: capture.quality,
                    stability_frames: capture.stability_frames,
                })
            }
            Err(error) => {
                log::warn!("Saving degraded enrollment record: {}", error);
                RecordDocument::Degraded(DegradedRecord {
                    timestamp: timestamp.clone(),
                    face_image_path,
                    face_image_filename,
                    face_rectangle: capture.rect,
                    error,
                })
            }
        };

        let record_path = self.records_dir.join(format!("user_face_{}.json", timestamp));
        let document = match write_json(&record_path, &document) {
            Ok(()) => document,
            Err(e) if document.is_complete() => {
                log::warn!("Failed to write full record, retrying degraded: {}", e);
                let degraded = document.degrade(e.to_string());
                write_json(&record_path, &degraded)?;
                degraded
            }
            Err(e) => return Err(e),
        };

        log::info!("User face data saved to: {}", record_path.display());
        Ok(SavedRecord {
            record_path,
            document,
        })
    }

    /// Every readable record, oldest first
    pub fn list(&self) -> Result<Vec<SavedRecord>, StorageError> {
        if !self.records_dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&self.records_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let contents = fs::read_to_string(&path)?;
            match serde_json::from_str::<RecordDocument>(&contents) {
                Ok(document) => records.push(SavedRecord {
                    record_path: path,
                    document,
                }),
                Err(e) => log::warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }

        records.sort_by(|a, b| a.document.timestamp().cmp(b.document.timestamp()));
        Ok(records)
    }
}

fn write_jpeg(path: &Path, region: &RgbImage) -> Result<(), StorageError> {
    let mut buffer = Vec::new();
    DynamicImage::ImageRgb8(region.clone()).write_to(&mut Cursor::new(&mut buffer), ImageFormat::Jpeg)?;
    write_atomic(path, &buffer)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::textured_frame;
    use crate::vision::GeometricSummary;
    use tempfile::TempDir;

    fn capture(region: &RgbImage) -> EnrollmentCapture<'_> {
        EnrollmentCapture {
            region,
            rect: Rect::new(10, 20, 48, 48),
            quality: 0.7,
            stability_frames: 10,
        }
    }

    fn features() -> FeatureSet {
        FeatureSet {
            geometry: Some(GeometricSummary::measure(48, 48, &[])),
            ..FeatureSet::default()
        }
    }

    #[test]
    fn test_complete_record() {
        let dir = TempDir::new().unwrap();
        let store = EnrollmentStore::new(dir.path().join("images"), dir.path().join("records"));
        let region = textured_frame(48, 48, 1);

        let saved = store.save(&capture(&region), Ok(features())).unwrap();
        let RecordDocument::Complete(record) = &saved.document else {
            panic!("expected a complete record");
        };
        assert!(record.face_image_path.is_file());
        assert!(record.face_image_filename.starts_with("face_snapshot_"));
        assert_eq!(record.stability_frames, 10);

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&saved.record_path).unwrap()).unwrap();
        assert_eq!(json["face_rectangle"]["width"], 48);
        assert!(json["features"]["geometry"].is_object());
        assert!(json.get("error").is_none());

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].document, saved.document);
    }

    #[test]
    fn test_back_to_back_records_do_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = EnrollmentStore::new(dir.path().join("images"), dir.path().join("records"));
        let region = textured_frame(48, 48, 4);

        let first = store.save(&capture(&region), Ok(features())).unwrap();
        let second = store.save(&capture(&region), Ok(features())).unwrap();

        assert_ne!(first.record_path, second.record_path);
        assert_ne!(first.document.timestamp(), second.document.timestamp());
        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(fs::read_dir(dir.path().join("images")).unwrap().count(), 2);
    }

    #[test]
    fn test_feature_failure_writes_degraded_record() {
        let dir = TempDir::new().unwrap();
        let store = EnrollmentStore::new(dir.path().join("images"), dir.path().join("records"));
        let region = textured_frame(48, 48, 2);

        let saved = store
            .save(&capture(&region), Err(VisionError::Features("no keypoints".into())))
            .unwrap();
        let RecordDocument::Degraded(record) = &saved.document else {
            panic!("expected a degraded record");
        };
        assert!(record.error.contains("no keypoints"));
        assert_eq!(record.face_rectangle, Rect::new(10, 20, 48, 48));
        assert!(!store.list().unwrap()[0].document.is_complete());
    }

    #[test]
    fn test_image_failure_writes_degraded_record() {
        let dir = TempDir::new().unwrap();
        let blocked = dir.path().join("images");
        fs::write(&blocked, b"not a directory").unwrap();
        let store = EnrollmentStore::new(&blocked, dir.path().join("records"));
        let region = textured_frame(48, 48, 3);

        let saved = store.save(&capture(&region), Ok(features())).unwrap();
        match saved.document {
            RecordDocument::Degraded(record) => {
                assert!(record.error.starts_with("failed to save face image"))
            }
            RecordDocument::Complete(_) => panic!("expected a degraded record"),
        }
        assert!(saved.record_path.is_file());
    }
}
