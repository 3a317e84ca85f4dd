//! presence-core — Face-recognition attendance engine.
//!
//! Uses SCRFD for face detection and a FaceNet embedding model, both running
//! via ONNX Runtime, then matches embeddings against an offline-built gallery
//! of known students and records matches in an attendance ledger.

pub mod detector;
pub mod embedder;
pub mod extractor;
pub mod gallery;
pub mod ledger;
pub mod pipeline;
pub mod types;

use std::path::PathBuf;

pub use detector::FaceDetector;
pub use embedder::FaceEmbedder;
pub use extractor::{EmbeddingExtractor, ExtractionError, OnnxExtractor};
pub use gallery::{Gallery, GalleryError, Identification, LabelStrategy, Neighbor};
pub use ledger::{AttendanceLedger, AttendanceReport};
pub use pipeline::{
    AttendanceUpdate, FaceStatus, PipelineConfig, PipelineError, RecognitionBatch,
    RecognitionPipeline, RecognitionResult, SkipReason,
};
pub use types::{BoundingBox, DetectedFace, Embedding, FaceBox};

/// Re-exported so callers hand the pipeline the same image type it works on.
pub use image::RgbImage;

/// System-wide model directory used when no override is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/presence/models")
}
