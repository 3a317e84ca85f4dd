//! SCRFD face detector via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor-free decoding and NMS post-processing.
//! The minimum detection score is chosen per call, so one loaded model serves
//! both the strict and the loose detection passes.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_MIN_OUTPUTS: usize = 6;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("SCRFD model not found at {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("empty image ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// How a source image was fitted into the square model input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    width: usize,
    height: usize,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    /// Fit `width` × `height` inside `input` × `input`, keeping the aspect ratio.
    fn fit(width: u32, height: u32, input: usize) -> Self {
        let side = input as f32;
        let scale = (side / width as f32).min(side / height as f32);
        let resized = |len: u32| ((len as f32 * scale).round() as usize).clamp(1, input);
        let (w, h) = (resized(width), resized(height));

        Self {
            scale,
            width: w,
            height: h,
            pad_x: (input - w) as f32 / 2.0,
            pad_y: (input - h) as f32 / 2.0,
        }
    }

    /// Map a point in model-input space back onto the source image.
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensors carrying one stride's scores and box distances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideHead {
    stride: usize,
    scores: usize,
    boxes: usize,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    heads: [StrideHead; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(path = model_path, outputs = ?output_names, "loaded SCRFD model");

        if output_names.len() < SCRFD_MIN_OUTPUTS {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs a score and a box output per stride, model has {} outputs",
                output_names.len()
            )));
        }

        let heads = stride_heads(&output_names);
        tracing::debug!(?heads, "SCRFD output heads");

        Ok(Self { session, heads })
    }

    /// Detect faces scoring above `min_confidence`, best first.
    pub fn detect(
        &mut self,
        image: &RgbImage,
        min_confidence: f32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(DetectorError::EmptyImage { width, height });
        }

        let letterbox = Letterbox::fit(width, height, SCRFD_INPUT_SIZE);
        let input = to_input_tensor(image, &letterbox);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for head in &self.heads {
            let extract = |index: usize, what: &str| {
                outputs[index]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} at stride {}: {e}", head.stride)))
            };
            let scores = extract(head.scores, "scores")?;
            let boxes = extract(head.boxes, "boxes")?;
            candidates.extend(decode_stride(
                scores,
                boxes,
                head.stride,
                SCRFD_INPUT_SIZE,
                &letterbox,
                min_confidence,
            ));
        }

        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), min_confidence, "SCRFD detection done");
        Ok(faces)
    }
}

/// Resize into the letterbox and normalise to a 1×3×N×N tensor.
///
/// Padding stays at 0.0, i.e. the mean colour after normalisation.
fn to_input_tensor(image: &RgbImage, letterbox: &Letterbox) -> Array4<f32> {
    let resized = imageops::resize(
        image,
        letterbox.width as u32,
        letterbox.height as u32,
        FilterType::Triangle,
    );
    let left = letterbox.pad_x.floor() as usize;
    let top = letterbox.pad_y.floor() as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for (channel, &value) in pixel.0.iter().enumerate() {
            tensor[[0, channel, top + y as usize, left + x as usize]] =
                (f32::from(value) - SCRFD_MEAN) / SCRFD_STD;
        }
    }
    tensor
}

/// Pair each stride with its score and box outputs.
///
/// Exports either name their outputs `score_<stride>` / `bbox_<stride>` or use
/// the positional layout: scores at 0..3, boxes at 3..6.
fn stride_heads(names: &[String]) -> [StrideHead; 3] {
    let index_of = |name: String| names.iter().position(|n| *n == name);
    let named = SCRFD_STRIDES.map(|stride| {
        Some(StrideHead {
            stride,
            scores: index_of(format!("score_{stride}"))?,
            boxes: index_of(format!("bbox_{stride}"))?,
        })
    });

    match named {
        [Some(a), Some(b), Some(c)] => [a, b, c],
        _ => {
            tracing::info!(?names, "SCRFD outputs are unnamed, assuming positional layout");
            let mut position = 0;
            SCRFD_STRIDES.map(|stride| {
                let head = StrideHead {
                    stride,
                    scores: position,
                    boxes: position + SCRFD_STRIDES.len(),
                };
                position += 1;
                head
            })
        }
    }
}

/// Turn one stride's anchor scores and distances into source-image boxes.
///
/// Anchors are laid out row-major over an `input / stride` grid, two per cell,
/// and each carries `[left, top, right, bottom]` distances in stride units.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: usize,
    input: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = input / stride;
    let step = stride as f32;

    scores
        .iter()
        .zip(boxes.chunks_exact(4))
        .take(grid * grid * SCRFD_ANCHORS_PER_CELL)
        .enumerate()
        .filter(|(_, (&score, _))| score > threshold)
        .map(|(anchor, (&score, dist))| {
            let cell = anchor / SCRFD_ANCHORS_PER_CELL;
            let cx = ((cell % grid) * stride) as f32;
            let cy = ((cell / grid) * stride) as f32;

            let (x1, y1) = letterbox.to_source(cx - dist[0] * step, cy - dist[1] * step);
            let (x2, y2) = letterbox.to_source(cx + dist[2] * step, cy + dist[3] * step);
            BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            }
        })
        .collect()
}

/// Greedy non-maximum suppression; survivors come back best first.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let overlap_w = (a.x + a.width).min(b.x + b.width) - a.x.max(b.x);
    let overlap_h = (a.y + a.height).min(b.y + b.height) - a.y.max(b.y);
    let inter = overlap_w.max(0.0) * overlap_h.max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: conf }
    }

    fn identity_letterbox() -> Letterbox {
        Letterbox { scale: 1.0, width: 64, height: 64, pad_x: 0.0, pad_y: 0.0 }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_iou_identical() {
        let a = make_bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(20.0, 20.0, 10.0, 10.0, 1.0);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_iou_half_shifted() {
        // 50 shared out of 150 total
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping_pair() {
        let candidates = vec![
            make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
            make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
        ];
        let kept: Vec<f32> = nms(candidates, 0.4).iter().map(|b| b.confidence).collect();
        assert_eq!(kept, vec![0.9, 0.7]);
    }

    #[test]
    fn test_nms_only_kept_boxes_suppress() {
        // b is suppressed by a; c overlaps b but not a, so it survives.
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = make_bbox(4.0, 0.0, 10.0, 10.0, 0.8);
        let c = make_bbox(10.0, 0.0, 10.0, 10.0, 0.7);
        assert_eq!(nms(vec![c, b, a], 0.4).len(), 2);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_landscape() {
        let lb = Letterbox::fit(320, 240, 640);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!((lb.width, lb.height), (640, 480));
        assert_eq!((lb.pad_x, lb.pad_y), (0.0, 80.0));
    }

    #[test]
    fn test_letterbox_extreme_aspect_never_zero() {
        let lb = Letterbox::fit(10_000, 1, 640);
        assert_eq!((lb.width, lb.height), (640, 1));
    }

    #[test]
    fn test_letterbox_to_source_inverts_fit() {
        let lb = Letterbox::fit(320, 240, 640);
        assert_eq!(lb.to_source(0.0, 80.0), (0.0, 0.0));
        assert_eq!(lb.to_source(640.0, 560.0), (320.0, 240.0));
    }

    #[test]
    fn test_decode_stride_respects_threshold() {
        // stride 32 on a 64x64 input: 2x2 grid, 2 anchors per cell = 8 anchors
        let mut scores = vec![0.0f32; 8];
        scores[0] = 0.7;
        scores[3] = 0.85;
        let boxes = vec![0.5f32; 8 * 4];

        let loose = decode_stride(&scores, &boxes, 32, 64, &identity_letterbox(), 0.6);
        assert_eq!(loose.len(), 2);

        let strict = decode_stride(&scores, &boxes, 32, 64, &identity_letterbox(), 0.8);
        assert_eq!(strict.len(), 1);
        assert!((strict[0].confidence - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_decode_stride_anchor_geometry() {
        // anchor 3 sits in cell 1, centred at (32, 0)
        let mut scores = vec![0.0f32; 8];
        scores[3] = 0.9;
        let boxes = vec![0.5f32; 8 * 4];

        let dets = decode_stride(&scores, &boxes, 32, 64, &identity_letterbox(), 0.5);
        assert_eq!(dets.len(), 1);
        assert!((dets[0].x - 16.0).abs() < 1e-4);
        assert!((dets[0].y + 16.0).abs() < 1e-4);
        assert!((dets[0].width - 32.0).abs() < 1e-4);
        assert!((dets[0].height - 32.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_stride_undoes_letterbox() {
        let mut scores = vec![0.0f32; 8];
        scores[0] = 0.9;
        let boxes = [0.0, 0.0, 1.0, 1.0].repeat(8);
        let letterbox = Letterbox { scale: 2.0, width: 64, height: 44, pad_x: 0.0, pad_y: 10.0 };

        let dets = decode_stride(&scores, &boxes, 32, 64, &letterbox, 0.5);
        assert_eq!(dets.len(), 1);
        assert!((dets[0].y + 5.0).abs() < 1e-4);
        assert!((dets[0].width - 16.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_stride_ignores_short_box_tensor() {
        let scores = vec![0.9f32; 8];
        let boxes = vec![0.5f32; 3 * 4 + 2];
        let dets = decode_stride(&scores, &boxes, 32, 64, &identity_letterbox(), 0.5);
        assert_eq!(dets.len(), 3);
    }

    #[test]
    fn test_stride_heads_named() {
        let heads = stride_heads(&names(&[
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ]));
        assert_eq!(heads[0], StrideHead { stride: 8, scores: 2, boxes: 0 });
        assert_eq!(heads[1], StrideHead { stride: 16, scores: 5, boxes: 3 });
        assert_eq!(heads[2], StrideHead { stride: 32, scores: 8, boxes: 6 });
    }

    #[test]
    fn test_stride_heads_positional_when_unnamed() {
        let unnamed: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        let heads = stride_heads(&unnamed);
        let pairs: Vec<(usize, usize, usize)> =
            heads.iter().map(|h| (h.stride, h.scores, h.boxes)).collect();
        assert_eq!(pairs, vec![(8, 0, 3), (16, 1, 4), (32, 2, 5)]);
    }

    #[test]
    fn test_stride_heads_partial_names_fall_back() {
        let heads = stride_heads(&names(&[
            "score_8", "score_16", "score_32", "bbox_8", "bbox_16", "boxes_32",
        ]));
        assert_eq!(heads[2], StrideHead { stride: 32, scores: 2, boxes: 5 });
    }
}
