//! Recognition pipeline: detect → embed → match → threshold.
//!
//! Two variants share the per-face decision:
//! - inspect ([`RecognitionPipeline::recognize`]) reports every face, known or not,
//!   and never touches the ledger;
//! - commit ([`RecognitionPipeline::mark_attendance`]) records recognized faces in
//!   the ledger and fails when nothing was recognized.
//!
//! A face that cannot be processed is skipped with a [`SkipReason`]; it never
//! aborts the rest of the batch.

use crate::extractor::EmbeddingExtractor;
use crate::gallery::{Gallery, LabelStrategy};
use crate::ledger::AttendanceLedger;
use crate::types::{DetectedFace, FaceBox};
use image::RgbImage;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Maximum nearest-neighbor distance at which a face is still a known student.
pub const CONFIDENCE_THRESHOLD: f32 = 0.9;
/// Detector score required by the inspect variant.
pub const INSPECT_DETECTION_THRESHOLD: f32 = 0.8;
/// Looser detector score for the commit variant: more candidates, same identity gate.
pub const COMMIT_DETECTION_THRESHOLD: f32 = 0.6;
/// Label reported for faces that match nobody.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Tunables for both pipeline variants.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub match_threshold: f32,
    pub inspect_detection_threshold: f32,
    pub commit_detection_threshold: f32,
    /// k for the majority vote used when committing attendance; `None` uses
    /// the k the gallery was trained with.
    pub vote_neighbors: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            match_threshold: CONFIDENCE_THRESHOLD,
            inspect_detection_threshold: INSPECT_DETECTION_THRESHOLD,
            commit_detection_threshold: COMMIT_DETECTION_THRESHOLD,
            vote_neighbors: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceStatus {
    Recognized,
    Unknown,
}

/// Decision for one detected face.
#[derive(Debug, Clone, Serialize)]
pub struct RecognitionResult {
    pub label: String,
    /// `1 - distance` for recognized faces, 0 for unknown ones.
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: FaceBox,
    pub status: FaceStatus,
}

/// Why a detected face produced no result.
#[derive(Debug, Clone, Error)]
pub enum SkipReason {
    #[error("degenerate crop at {bbox:?}")]
    DegenerateCrop { bbox: FaceBox },
    #[error("embedding failed at {bbox:?}: {error}")]
    Extraction { bbox: FaceBox, error: String },
    #[error("gallery lookup failed at {bbox:?}: {error}")]
    Matching { bbox: FaceBox, error: String },
}

/// Inspect-variant output.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecognitionBatch {
    /// One entry per processed face, in detection order.
    pub results: Vec<RecognitionResult>,
    #[serde(skip)]
    pub skipped: Vec<SkipReason>,
}

/// Commit-variant output.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceUpdate {
    pub status: &'static str,
    /// Label of every recognized face, in detection order.
    pub recognized: Vec<String>,
    /// Ledger size right after this update.
    pub total_attendance: usize,
    #[serde(skip)]
    pub skipped: Vec<SkipReason>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("face detection failed: {0}")]
    Detection(String),
    #[error("no face recognized or all faces are unknown")]
    NoFaceRecognized {
        faces_detected: usize,
        skipped: Vec<SkipReason>,
    },
}

/// Extractor + gallery, constructed once and driven per request.
pub struct RecognitionPipeline<E> {
    extractor: E,
    gallery: Arc<Gallery>,
    config: PipelineConfig,
}

impl<E: EmbeddingExtractor> RecognitionPipeline<E> {
    pub fn new(extractor: E, gallery: Arc<Gallery>, config: PipelineConfig) -> Self {
        Self {
            extractor,
            gallery,
            config,
        }
    }

    pub fn gallery(&self) -> &Arc<Gallery> {
        &self.gallery
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// k used by the commit vote.
    pub fn vote_neighbors(&self) -> usize {
        self.config
            .vote_neighbors
            .unwrap_or_else(|| self.gallery.n_neighbors())
            .max(1)
    }

    /// Classify every face in `image` without touching attendance.
    pub fn recognize(&mut self, image: &RgbImage) -> Result<RecognitionBatch, PipelineError> {
        let batch = self.run(
            image,
            self.config.inspect_detection_threshold,
            LabelStrategy::NearestNeighbor,
        )?;

        tracing::info!(
            faces = batch.results.len(),
            recognized = batch
                .results
                .iter()
                .filter(|r| r.status == FaceStatus::Recognized)
                .count(),
            skipped = batch.skipped.len(),
            "recognize done"
        );
        Ok(batch)
    }

    /// Record every recognized face in `ledger`.
    ///
    /// Fails with [`PipelineError::NoFaceRecognized`] and leaves the ledger
    /// untouched when no face was detected or every face was unknown.
    pub fn mark_attendance(
        &mut self,
        image: &RgbImage,
        ledger: &AttendanceLedger,
    ) -> Result<AttendanceUpdate, PipelineError> {
        let strategy = LabelStrategy::MajorityVote {
            k: self.vote_neighbors(),
        };
        let batch = self.run(image, self.config.commit_detection_threshold, strategy)?;

        let faces_detected = batch.results.len() + batch.skipped.len();
        let recognized: Vec<String> = batch
            .results
            .into_iter()
            .filter(|r| r.status == FaceStatus::Recognized)
            .map(|r| r.label)
            .collect();

        if recognized.is_empty() {
            tracing::info!(faces_detected, "mark-attendance: no face recognized");
            return Err(PipelineError::NoFaceRecognized {
                faces_detected,
                skipped: batch.skipped,
            });
        }

        let total_attendance = ledger.mark_all(&recognized);
        tracing::info!(?recognized, total_attendance, "mark-attendance done");

        Ok(AttendanceUpdate {
            status: "success",
            recognized,
            total_attendance,
            skipped: batch.skipped,
        })
    }

    fn run(
        &mut self,
        image: &RgbImage,
        detection_threshold: f32,
        strategy: LabelStrategy,
    ) -> Result<RecognitionBatch, PipelineError> {
        let faces = self
            .extractor
            .detect_faces(image, detection_threshold)
            .map_err(|e| PipelineError::Detection(e.to_string()))?;

        tracing::debug!(faces = faces.len(), detection_threshold, "faces detected");

        let mut batch = RecognitionBatch::default();
        for face in &faces {
            match self.classify(face, strategy) {
                Ok(result) => batch.results.push(result),
                Err(reason) => {
                    tracing::warn!(%reason, "face skipped");
                    batch.skipped.push(reason);
                }
            }
        }

        Ok(batch)
    }

    fn classify(
        &mut self,
        face: &DetectedFace,
        strategy: LabelStrategy,
    ) -> Result<RecognitionResult, SkipReason> {
        let bbox = face.bbox;
        if face.is_degenerate() {
            return Err(SkipReason::DegenerateCrop { bbox });
        }

        let embedding = self
            .extractor
            .embed(&face.crop)
            .map_err(|e| SkipReason::Extraction {
                bbox,
                error: e.to_string(),
            })?;

        let id = self
            .gallery
            .identify(&embedding, strategy)
            .map_err(|e| SkipReason::Matching {
                bbox,
                error: e.to_string(),
            })?;

        tracing::debug!(label = id.label, distance = id.distance, ?bbox, "nearest gallery match");

        if id.distance < self.config.match_threshold {
            Ok(RecognitionResult {
                label: id.label.to_string(),
                // Only reachable for thresholds above 1.0.
                confidence: (1.0 - id.distance).clamp(0.0, 1.0),
                bbox,
                status: FaceStatus::Recognized,
            })
        } else {
            Ok(RecognitionResult {
                label: UNKNOWN_LABEL.to_string(),
                confidence: 0.0,
                bbox,
                status: FaceStatus::Unknown,
            })
        }
    }
}
