//! SCRFD face detection: letterbox preprocessing, multi-stride anchor
//! decoding and non-max suppression.
//!
//! The ONNX session only produces raw per-stride tensors. Everything around it
//! is plain arithmetic so it can be tested without a model file.

use std::path::Path;

use image::{imageops::FilterType, DynamicImage, GenericImageView, RgbImage};
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{BoundingBox, FaceDetection, Keypoints, Point};

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("failed to load detector model {path}: {message}")]
    Load { path: String, message: String },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("unexpected model output: {0}")]
    Output(String),
    #[error("image has zero size")]
    EmptyImage,
}

/// Detector tuning. Input geometry and normalisation may be overridden by
/// model metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub input_size: u32,
    pub score_threshold: f32,
    pub iou_threshold: f32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub strides: Vec<u32>,
    pub anchors_per_cell: usize,
    pub intra_threads: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_size: 640,
            score_threshold: 0.8,
            iou_threshold: 0.4,
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
            strides: vec![8, 16, 32],
            anchors_per_cell: 2,
            intra_threads: 1,
        }
    }
}

/// Mapping between original image coordinates and the letterboxed input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub width: u32,
    pub height: u32,
}

impl Letterbox {
    pub fn compute(width: u32, height: u32, size: u32) -> Self {
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).min(size);
        let new_h = ((height as f32 * scale).round() as u32).min(size);
        Self {
            scale,
            pad_x: ((size - new_w) / 2) as f32,
            pad_y: ((size - new_h) / 2) as f32,
            width,
            height,
        }
    }

    pub fn to_original(&self, p: Point) -> Point {
        let max_x = (self.width as f32 - 1.0).max(0.0);
        let max_y = (self.height as f32 - 1.0).max(0.0);
        Point::new(
            ((p.x - self.pad_x) / self.scale).clamp(0.0, max_x),
            ((p.y - self.pad_y) / self.scale).clamp(0.0, max_y),
        )
    }

    pub fn box_to_original(&self, b: &BoundingBox) -> BoundingBox {
        let tl = self.to_original(Point::new(b.x1, b.y1));
        let br = self.to_original(Point::new(b.x2, b.y2));
        BoundingBox {
            x1: tl.x,
            y1: tl.y,
            x2: br.x,
            y2: br.y,
        }
    }
}

/// Resize with preserved aspect ratio onto a centered square canvas and
/// normalise into an NCHW tensor.
pub fn letterbox(
    image: &DynamicImage,
    size: u32,
    mean: [f32; 3],
    std: [f32; 3],
) -> Result<(Array4<f32>, Letterbox), DetectorError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(DetectorError::EmptyImage);
    }
    let lb = Letterbox::compute(width, height, size);
    let new_w = ((width as f32 * lb.scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * lb.scale).round() as u32).clamp(1, size);
    let resized = image.resize_exact(new_w, new_h, FilterType::Triangle).to_rgb8();

    let mut canvas = RgbImage::new(size, size);
    image::imageops::overlay(&mut canvas, &resized, lb.pad_x as i64, lb.pad_y as i64);

    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, px) in canvas.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 / 255.0 - mean[c]) / std[c];
        }
    }
    Ok((tensor, lb))
}

/// A decoded box in letterboxed input coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub bbox: BoundingBox,
    pub score: f32,
    pub keypoints: Option<Keypoints>,
}

/// Decode one stride's raw outputs.
///
/// `scores` holds one value per anchor, `distances` four `(l, t, r, b)` values
/// per anchor and `kps` (if present) ten values per anchor, all in units of
/// `stride`. Anchor centers sit at `(col * stride, row * stride)`.
pub fn decode_stride(
    scores: &[f32],
    distances: &[f32],
    kps: Option<&[f32]>,
    input_size: u32,
    stride: u32,
    anchors_per_cell: usize,
    score_threshold: f32,
) -> Result<Vec<Candidate>, DetectorError> {
    if stride == 0 || anchors_per_cell == 0 {
        return Err(DetectorError::Output(format!(
            "stride {stride} with {anchors_per_cell} anchors per cell cannot be decoded"
        )));
    }
    let grid = (input_size / stride) as usize;
    let anchors = grid * grid * anchors_per_cell;
    if scores.len() < anchors || distances.len() < anchors * 4 {
        return Err(DetectorError::Output(format!(
            "stride {stride}: expected {anchors} anchors, got {} scores / {} distances",
            scores.len(),
            distances.len() / 4
        )));
    }
    let kps = kps.filter(|k| k.len() >= anchors * 10);

    let s = stride as f32;
    let mut out = Vec::new();
    for i in 0..anchors {
        let score = scores[i];
        if !(score >= score_threshold) {
            continue;
        }
        let cell = i / anchors_per_cell;
        let cx = (cell % grid) as f32 * s;
        let cy = (cell / grid) as f32 * s;
        let d = &distances[i * 4..i * 4 + 4];
        let bbox = BoundingBox {
            x1: cx - d[0] * s,
            y1: cy - d[1] * s,
            x2: cx + d[2] * s,
            y2: cy + d[3] * s,
        };
        if bbox.x2 <= bbox.x1 || bbox.y2 <= bbox.y1 {
            continue;
        }
        let keypoints = kps.map(|k| {
            let k = &k[i * 10..i * 10 + 10];
            let mut pts = [Point::default(); 5];
            for (j, p) in pts.iter_mut().enumerate() {
                *p = Point::new(cx + k[j * 2] * s, cy + k[j * 2 + 1] * s);
            }
            pts
        });
        out.push(Candidate {
            bbox,
            score,
            keypoints,
        });
    }
    Ok(out)
}

/// Greedy NMS: keep the highest-scoring box, drop everything overlapping it
/// by `iou_threshold` or more, repeat.
pub fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for c in candidates {
        if kept.iter().all(|k| k.bbox.iou(&c.bbox) < iou_threshold) {
            kept.push(c);
        }
    }
    kept
}

/// Anything that can find the single most prominent face in an image.
pub trait FaceDetect: Send {
    fn detect(&mut self, image: &DynamicImage) -> Result<Option<FaceDetection>, DetectorError>;

    /// Model name/version reported alongside detections.
    fn model_tag(&self) -> &str;
}

/// ONNX Runtime backed SCRFD detector.
pub struct ScrfdDetector {
    session: Session,
    config: DetectorConfig,
    model_tag: String,
}

impl ScrfdDetector {
    pub fn load(
        path: &Path,
        config: DetectorConfig,
        model_tag: impl Into<String>,
    ) -> Result<Self, DetectorError> {
        let load_err = |e: ort::Error| DetectorError::Load {
            path: path.display().to_string(),
            message: e.to_string(),
        };
        let session = Session::builder()
            .map_err(load_err)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(load_err)?
            .with_intra_threads(config.intra_threads.max(1))
            .map_err(load_err)?
            .commit_from_file(path)
            .map_err(load_err)?;

        Ok(Self {
            session,
            config,
            model_tag: model_tag.into(),
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    fn run(&mut self, input: Array4<f32>) -> Result<Vec<Candidate>, DetectorError> {
        let cfg = &self.config;
        let tensor =
            Tensor::from_array(input).map_err(|e| DetectorError::Inference(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| DetectorError::Inference(e.to_string()))?;

        // SCRFD exports scores for every stride, then distances, then
        // (optionally) keypoints.
        let n = cfg.strides.len();
        let has_kps = outputs.len() >= n * 3;
        if outputs.len() < n * 2 {
            tracing::warn!(
                model = %self.model_tag,
                strides = n,
                outputs = outputs.len(),
                "detector output count does not match configured strides"
            );
            return Err(DetectorError::Output(format!(
                "expected at least {} outputs, got {}",
                n * 2,
                outputs.len()
            )));
        }

        let extract = |idx: usize| -> Result<Vec<f32>, DetectorError> {
            let (_, data) = outputs[idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::Output(e.to_string()))?;
            Ok(data.to_vec())
        };

        let mut candidates = Vec::new();
        for (i, &stride) in cfg.strides.iter().enumerate() {
            let scores = extract(i)?;
            let distances = extract(n + i)?;
            let kps = if has_kps { Some(extract(2 * n + i)?) } else { None };
            let decoded = decode_stride(
                &scores,
                &distances,
                kps.as_deref(),
                cfg.input_size,
                stride,
                cfg.anchors_per_cell,
                cfg.score_threshold,
            )
            .map_err(|e| {
                tracing::warn!(model = %self.model_tag, stride, error = %e, "stride decode failed");
                e
            })?;
            candidates.extend(decoded);
        }
        Ok(candidates)
    }
}

impl FaceDetect for ScrfdDetector {
    fn detect(&mut self, image: &DynamicImage) -> Result<Option<FaceDetection>, DetectorError> {
        let (input, lb) = letterbox(image, self.config.input_size, self.config.mean, self.config.std)?;
        let candidates = self.run(input)?;
        let best = non_max_suppression(candidates, self.config.iou_threshold)
            .into_iter()
            .next();

        Ok(best.map(|c| FaceDetection {
            bbox: lb.box_to_original(&c.bbox),
            confidence: c.score,
            keypoints: c.keypoints.map(|k| k.map(|p| lb.to_original(p))),
            model: self.model_tag.clone(),
        }))
    }

    fn model_tag(&self) -> &str {
        &self.model_tag
    }
}
