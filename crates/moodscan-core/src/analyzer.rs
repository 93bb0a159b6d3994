//! Emotion analysis capability and the adapter that reduces it to one label.

use crate::classifier::{ClassifierError, ExpressionClassifier};
use crate::detector::{DetectorError, FaceDetector};
use crate::types::{BoundingBox, Emotion, FaceAnalysis, FaceRegion};
use image::ImageReader;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// SCRFD detection model file name inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// Expression classification model file name inside the model directory.
pub const EXPRESSION_MODEL_FILE: &str = "facial_expression.onnx";

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("failed to read image {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode image {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("no face detected in {0} (enforce_detection is on)")]
    NoFaceDetected(PathBuf),
    #[error("analysis returned no results")]
    EmptyResult,
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("classifier error: {0}")]
    Classifier(#[from] ClassifierError),
}

/// Per-call analysis options.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeOptions {
    /// Fail instead of falling back to the whole image when no face is found.
    pub enforce_detection: bool,
}

/// Which face detector runs before classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectorBackend {
    #[default]
    Scrfd,
    /// No detection: the whole image is one face region.
    Skip,
}

impl DetectorBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorBackend::Scrfd => "scrfd",
            DetectorBackend::Skip => "skip",
        }
    }
}

impl fmt::Display for DetectorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scrfd" => Ok(DetectorBackend::Scrfd),
            "skip" => Ok(DetectorBackend::Skip),
            other => Err(format!("unknown detector backend {other:?} (expected scrfd or skip)")),
        }
    }
}

/// Anything that can analyse the faces in an image file.
///
/// Implementations return one record per face, strongest detection first.
pub trait EmotionAnalyzer {
    fn analyze(
        &mut self,
        path: &Path,
        options: &AnalyzeOptions,
    ) -> Result<Vec<FaceAnalysis>, AnalysisError>;
}

/// Run `analyzer` for emotion only, without enforcing face detection, and
/// return the dominant emotion of the first record.
pub fn dominant_emotion<A>(analyzer: &mut A, path: &Path) -> Result<Emotion, AnalysisError>
where
    A: EmotionAnalyzer + ?Sized,
{
    let options = AnalyzeOptions { enforce_detection: false };
    let results = analyzer.analyze(path, &options)?;
    results
        .first()
        .map(|face| face.dominant_emotion)
        .ok_or(AnalysisError::EmptyResult)
}

/// Default analyzer: SCRFD face detection followed by expression classification.
pub struct OnnxEmotionAnalyzer {
    detector: Option<FaceDetector>,
    classifier: ExpressionClassifier,
}

impl OnnxEmotionAnalyzer {
    /// Load both models from `model_dir`. The detector is skipped for [`DetectorBackend::Skip`].
    pub fn load(
        model_dir: &Path,
        backend: DetectorBackend,
        intra_threads: usize,
    ) -> Result<Self, AnalysisError> {
        let detector = match backend {
            DetectorBackend::Scrfd => {
                let path = model_dir.join(DETECTOR_MODEL_FILE);
                Some(FaceDetector::load(&path, intra_threads)?)
            }
            DetectorBackend::Skip => None,
        };
        let classifier =
            ExpressionClassifier::load(&model_dir.join(EXPRESSION_MODEL_FILE), intra_threads)?;

        Ok(Self { detector, classifier })
    }
}

impl EmotionAnalyzer for OnnxEmotionAnalyzer {
    fn analyze(
        &mut self,
        path: &Path,
        options: &AnalyzeOptions,
    ) -> Result<Vec<FaceAnalysis>, AnalysisError> {
        // Format is sniffed from content; uploaded names carry no guarantee.
        let image = ImageReader::open(path)
            .and_then(|r| r.with_guessed_format())
            .map_err(|source| AnalysisError::Io { path: path.to_path_buf(), source })?
            .decode()
            .map_err(|source| AnalysisError::Decode { path: path.to_path_buf(), source })?;

        let (width, height) = (image.width(), image.height());
        let faces = match self.detector.as_mut() {
            Some(detector) => detector.detect(&image.to_rgb8())?,
            None => Vec::new(),
        };

        let regions = face_regions(&faces, width, height, options.enforce_detection)
            .ok_or_else(|| AnalysisError::NoFaceDetected(path.to_path_buf()))?;

        let gray = image.to_luma8();
        let mut results = Vec::with_capacity(regions.len());
        for (region, confidence) in regions {
            let scores = self.classifier.classify(&gray, region)?;
            results.push(FaceAnalysis::new(region, confidence, scores));
        }

        tracing::debug!(
            path = %path.display(),
            faces = results.len(),
            dominant = ?results.first().map(|r| r.dominant_emotion),
            "analysis complete"
        );

        Ok(results)
    }
}

/// Turn detections into clamped regions paired with their confidence.
///
/// With no usable detection the whole image stands in at confidence 0.0,
/// unless `enforce_detection` is set, in which case `None` is returned.
fn face_regions(
    faces: &[BoundingBox],
    width: u32,
    height: u32,
    enforce_detection: bool,
) -> Option<Vec<(FaceRegion, f32)>> {
    let regions: Vec<(FaceRegion, f32)> = faces
        .iter()
        .filter_map(|face| FaceRegion::clamped(face, width, height).map(|r| (r, face.confidence)))
        .collect();

    if !regions.is_empty() {
        Some(regions)
    } else if enforce_detection {
        None
    } else {
        Some(vec![(FaceRegion::full(width, height), 0.0)])
    }
}

/// Default model directory: `$XDG_DATA_HOME/moodscan/models`, falling back
/// to `~/.local/share/moodscan/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("moodscan")
        .join("models")
}
