//! ArcFace face encoder and the ONNX-backed [`Recognizer`].
//!
//! Embeddings are 512-dimensional and L2-normalized, extracted from
//! landmark-aligned 112×112 crops (box crops when a face has no landmarks).

use crate::alignment::{self, ALIGNED_SIZE};
use crate::capability::Recognizer;
use crate::detector::{DetectorError, FaceDetector};
use crate::frame::Frame;
use crate::types::{BoundingBox, Embedding, GalleryEntry, MatchResult, Matcher, NearestMatcher};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

/// Confidence used when locating faces for recognition.
pub const LOCATE_CONFIDENCE: f32 = 0.5;

/// Default maximum Euclidean distance between unit embeddings for a known match.
///
/// Equivalent to a cosine similarity of 0.395.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 1.10;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (download from insightface into the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace embedding extractor.
pub struct FaceEncoder {
    session: Session,
}

impl FaceEncoder {
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Embed one face from `frame`.
    pub fn encode_face(&mut self, frame: &Frame, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let crop = match &face.landmarks {
            Some(landmarks) => alignment::align_face(frame, landmarks),
            None => alignment::crop_face(frame, face),
        };
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

/// 112×112 grayscale crop → `1×3×112×112` tensor, gray replicated across channels.
fn preprocess(crop: &[u8]) -> Array4<f32> {
    let size = ALIGNED_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let pixel = crop.get(y * size + x).copied().unwrap_or(0) as f32;
            let v = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
            for c in 0..3 {
                tensor[[0, c, y, x]] = v;
            }
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

/// SCRFD locate + ArcFace encode + nearest-neighbour match.
pub struct OnnxRecognizer {
    locator: FaceDetector,
    encoder: FaceEncoder,
    match_threshold: f32,
}

impl OnnxRecognizer {
    pub fn new(locator: FaceDetector, encoder: FaceEncoder, match_threshold: f32) -> Self {
        Self {
            locator,
            encoder,
            match_threshold,
        }
    }

    /// Load both models from `scrfd_path` and `arcface_path`.
    pub fn load(scrfd_path: &Path, arcface_path: &Path, match_threshold: f32) -> Result<Self, RecognizerError> {
        let locator = FaceDetector::load(scrfd_path, LOCATE_CONFIDENCE)?;
        let encoder = FaceEncoder::load(arcface_path)?;
        Ok(Self::new(locator, encoder, match_threshold))
    }

    pub fn match_threshold(&self) -> f32 {
        self.match_threshold
    }
}

impl Recognizer for OnnxRecognizer {
    type Error = RecognizerError;

    fn locate(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, RecognizerError> {
        Ok(self.locator.detect_faces(frame)?)
    }

    fn encode(&mut self, frame: &Frame, boxes: &[BoundingBox]) -> Result<Vec<Embedding>, RecognizerError> {
        boxes.iter().map(|b| self.encoder.encode_face(frame, b)).collect()
    }

    fn best_match(&self, gallery: &[GalleryEntry], probe: &Embedding) -> MatchResult {
        NearestMatcher.compare(probe, gallery, self.match_threshold)
    }
}
