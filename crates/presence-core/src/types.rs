use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in source image coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Integer pixel region of a face, serialized as `[x, y, width, height]`.
///
/// May extend past the image edges; only the in-bounds part is cropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "[i32; 4]", from = "[i32; 4]")]
pub struct FaceBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl From<&BoundingBox> for FaceBox {
    /// Truncates toward zero, the way detector boxes are reported to clients.
    fn from(b: &BoundingBox) -> Self {
        Self {
            x: b.x as i32,
            y: b.y as i32,
            width: b.width as i32,
            height: b.height as i32,
        }
    }
}

impl From<FaceBox> for [i32; 4] {
    fn from(b: FaceBox) -> Self {
        [b.x, b.y, b.width, b.height]
    }
}

impl From<[i32; 4]> for FaceBox {
    fn from([x, y, width, height]: [i32; 4]) -> Self {
        Self { x, y, width, height }
    }
}

impl FaceBox {
    /// Clip to a `width` × `height` image, returning `(x, y, w, h)` or `None`
    /// when nothing of the box lies inside the image.
    pub fn clip(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.clamp(0, width as i32);
        let y0 = self.y.clamp(0, height as i32);
        let x1 = self.x.saturating_add(self.width).clamp(0, width as i32);
        let y1 = self.y.saturating_add(self.height).clamp(0, height as i32);

        if x1 > x0 && y1 > y0 {
            Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
        } else {
            None
        }
    }
}

/// A face located in a source image, with the pixels used to embed it.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: FaceBox,
    /// Detector score for this region.
    pub confidence: f32,
    /// RGB crop of the in-bounds region; zero-sized when the box is degenerate.
    pub crop: RgbImage,
}

impl DetectedFace {
    /// Cut the face region for `detection` out of `image`.
    pub fn from_detection(image: &RgbImage, detection: &BoundingBox) -> Self {
        let bbox = FaceBox::from(detection);
        let crop = match bbox.clip(image.width(), image.height()) {
            Some((x, y, w, h)) => imageops::crop_imm(image, x, y, w, h).to_image(),
            None => RgbImage::new(0, 0),
        };

        Self {
            bbox,
            confidence: detection.confidence,
            crop,
        }
    }

    /// True when the crop holds no pixels and must not be embedded.
    pub fn is_degenerate(&self) -> bool {
        self.crop.width() == 0 || self.crop.height() == 0
    }
}

/// Face embedding vector (512-dimensional for the shipped FaceNet model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "facenet512").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}
