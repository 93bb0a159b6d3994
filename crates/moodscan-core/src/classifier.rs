//! Facial expression classifier via ONNX Runtime.
//!
//! Scores a grayscale face crop against the seven expression classes. The
//! model takes a 48×48 single-channel NHWC tensor with pixels scaled to [0, 1].

use crate::types::{EmotionScores, FaceRegion};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const EXPRESSION_INPUT_SIZE: u32 = 48;
const EXPRESSION_CLASSES: usize = 7;
/// Outputs whose sum strays further than this from 1.0 are treated as logits.
const PROBABILITY_TOLERANCE: f32 = 1e-3;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0} — place the expression model (facial_expression.onnx) in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region {region:?} lies outside the {width}x{height} image")]
    RegionOutOfBounds { region: FaceRegion, width: u32, height: u32 },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

pub struct ExpressionClassifier {
    session: Session,
}

impl ExpressionClassifier {
    /// Load the expression ONNX model from the given path.
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, ClassifierError> {
        if !model_path.exists() {
            return Err(ClassifierError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded expression model"
        );

        Ok(Self { session })
    }

    /// Score the expression of the face inside `region`.
    pub fn classify(
        &mut self,
        gray: &GrayImage,
        region: FaceRegion,
    ) -> Result<EmotionScores, ClassifierError> {
        if region.x + region.w > gray.width() || region.y + region.h > gray.height() {
            return Err(ClassifierError::RegionOutOfBounds {
                region,
                width: gray.width(),
                height: gray.height(),
            });
        }

        let crop = imageops::crop_imm(gray, region.x, region.y, region.w, region.h).to_image();
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("expression scores: {e}")))?;

        let raw: [f32; EXPRESSION_CLASSES] = raw.try_into().map_err(|_| {
            ClassifierError::InferenceFailed(format!(
                "expected {EXPRESSION_CLASSES} expression scores, got {}",
                raw.len()
            ))
        })?;

        Ok(EmotionScores::from_probabilities(normalize(raw)))
    }
}

/// Resize a face crop to the model input and scale it into a [1, 48, 48, 1] tensor.
fn preprocess(crop: &GrayImage) -> Array4<f32> {
    let size = EXPRESSION_INPUT_SIZE;
    let resized = imageops::resize(crop, size, size, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, size as usize, size as usize, 1));
    for (x, y, pixel) in resized.enumerate_pixels() {
        tensor[[0, y as usize, x as usize, 0]] = pixel[0] as f32 / 255.0;
    }
    tensor
}

/// Pass probability outputs through; softmax anything else.
fn normalize(raw: [f32; EXPRESSION_CLASSES]) -> [f32; EXPRESSION_CLASSES] {
    let sum: f32 = raw.iter().sum();
    let is_distribution = raw.iter().all(|&v| (0.0..=1.0).contains(&v))
        && (sum - 1.0).abs() < PROBABILITY_TOLERANCE;
    if is_distribution {
        return raw;
    }

    let max = raw.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp = raw.map(|v| (v - max).exp());
    let total: f32 = exp.iter().sum();
    exp.map(|v| v / total)
}
