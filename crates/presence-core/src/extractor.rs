//! Face detection + embedding behind one seam.
//!
//! The recognition pipeline only talks to [`EmbeddingExtractor`]; the ONNX
//! implementation pairs the SCRFD detector with the FaceNet embedder.

use crate::detector::{DetectorError, FaceDetector};
use crate::embedder::{EmbedderError, FaceEmbedder};
use crate::types::{DetectedFace, Embedding};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
}

/// Locates faces in an image and maps face crops into identity space.
///
/// Methods take `&mut self` because ONNX sessions need exclusive access to run.
pub trait EmbeddingExtractor {
    /// All faces scoring above `min_confidence`, in detection order.
    /// An image without faces yields an empty list.
    fn detect_faces(
        &mut self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> Result<Vec<DetectedFace>, ExtractionError>;

    /// Identity embedding of a non-degenerate face crop.
    fn embed(&mut self, crop: &RgbImage) -> Result<Embedding, ExtractionError>;
}

/// SCRFD detection + FaceNet embedding, loaded once at startup.
pub struct OnnxExtractor {
    detector: FaceDetector,
    embedder: FaceEmbedder,
}

impl OnnxExtractor {
    pub fn load(detector_path: &str, embedder_path: &str) -> Result<Self, ExtractionError> {
        let detector = FaceDetector::load(detector_path)?;
        let embedder = FaceEmbedder::load(embedder_path)?;
        Ok(Self { detector, embedder })
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn detect_faces(
        &mut self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> Result<Vec<DetectedFace>, ExtractionError> {
        let boxes = self.detector.detect(image, min_confidence)?;
        Ok(boxes
            .iter()
            .map(|b| DetectedFace::from_detection(image, b))
            .collect())
    }

    fn embed(&mut self, crop: &RgbImage) -> Result<Embedding, ExtractionError> {
        Ok(self.embedder.embed(crop)?)
    }
}
