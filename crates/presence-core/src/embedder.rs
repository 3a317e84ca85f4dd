//! FaceNet face embedder via ONNX Runtime.
//!
//! Turns an RGB face crop into a 512-dimensional, L2-normalized identity
//! embedding. Euclidean distances between these vectors fall in [0, 2].

use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (different from SCRFD!) ---
const FACENET_INPUT_SIZE: usize = 160;
const FACENET_EMBEDDING_DIM: usize = 512;
const FACENET_MODEL_VERSION: &str = "facenet512";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0} — export the FaceNet model to ONNX and place it in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("degenerate face crop ({width}x{height})")]
    DegenerateCrop { width: u32, height: u32 },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// FaceNet-based face embedder.
pub struct FaceEmbedder {
    session: Session,
}

impl FaceEmbedder {
    /// Load the FaceNet ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        Ok(Self { session })
    }

    /// Extract an embedding from an RGB face crop.
    ///
    /// The crop is resized to 160x160 regardless of its aspect ratio.
    pub fn embed(&mut self, crop: &RgbImage) -> Result<Embedding, EmbedderError> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(EmbedderError::DegenerateCrop {
                width: crop.width(),
                height: crop.height(),
            });
        }

        let input = Self::preprocess(crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != FACENET_EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {FACENET_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(FACENET_MODEL_VERSION.to_string()),
        })
    }

    /// Resize and prewhiten a face crop into a NHWC float tensor.
    ///
    /// Prewhitening standardizes the whole crop to zero mean and unit
    /// variance; the std is floored at 1/sqrt(N) so flat crops stay finite.
    fn preprocess(crop: &RgbImage) -> Array4<f32> {
        let size = FACENET_INPUT_SIZE;
        let resized = imageops::resize(crop, size as u32, size as u32, FilterType::Triangle);

        let n = (size * size * 3) as f32;
        let mean = resized.as_raw().iter().map(|&p| p as f32).sum::<f32>() / n;
        let variance = resized
            .as_raw()
            .iter()
            .map(|&p| (p as f32 - mean).powi(2))
            .sum::<f32>()
            / n;
        let std = variance.sqrt().max(1.0 / n.sqrt());

        let mut tensor = Array4::<f32>::zeros((1, size, size, 3));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, y as usize, x as usize, c]] = (pixel[c] as f32 - mean) / std;
            }
        }

        tensor
    }
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_output_shape() {
        let crop = RgbImage::from_pixel(40, 60, image::Rgb([128, 64, 32]));
        let tensor = FaceEmbedder::preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, FACENET_INPUT_SIZE, FACENET_INPUT_SIZE, 3]);
    }

    #[test]
    fn test_preprocess_prewhitening() {
        let mut crop = RgbImage::new(16, 16);
        for (x, y, pixel) in crop.enumerate_pixels_mut() {
            let v = ((x * 16 + y) % 256) as u8;
            *pixel = image::Rgb([v, v / 2, 255 - v]);
        }
        let tensor = FaceEmbedder::preprocess(&crop);

        let n = tensor.len() as f32;
        let mean = tensor.iter().sum::<f32>() / n;
        let var = tensor.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        assert!(mean.abs() < 1e-3, "mean = {mean}");
        assert!((var - 1.0).abs() < 1e-2, "variance = {var}");
    }

    #[test]
    fn test_preprocess_flat_crop_is_finite() {
        let crop = RgbImage::from_pixel(10, 10, image::Rgb([200, 200, 200]));
        let tensor = FaceEmbedder::preprocess(&crop);
        assert!(tensor.iter().all(|v| v.is_finite() && v.abs() < 1e-6));
    }

    #[test]
    fn test_l2_normalize_unit_length() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }
}
