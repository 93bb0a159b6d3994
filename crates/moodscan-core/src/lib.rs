//! moodscan-core: facial emotion analysis engine.
//!
//! Uses SCRFD for face detection and a 7-class facial expression model for
//! emotion scoring, both running via ONNX Runtime for CPU inference. Callers
//! depend on the [`EmotionAnalyzer`] trait, not on the ONNX implementation.

pub mod analyzer;
pub mod classifier;
pub mod detector;
pub mod types;

pub use analyzer::{
    default_model_dir, dominant_emotion, AnalysisError, AnalyzeOptions, DetectorBackend,
    EmotionAnalyzer, OnnxEmotionAnalyzer,
};
pub use classifier::ExpressionClassifier;
pub use detector::FaceDetector;
pub use types::{BoundingBox, Emotion, EmotionScores, FaceAnalysis, FaceRegion};
