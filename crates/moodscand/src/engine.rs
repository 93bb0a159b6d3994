use moodscan_core::{AnalysisError, Emotion, EmotionAnalyzer};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("analysis panicked: {0}")]
    Panicked(String),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Analyzer the engine thread takes ownership of.
pub type BoxedAnalyzer = Box<dyn EmotionAnalyzer + Send>;

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    DominantEmotion {
        path: PathBuf,
        reply: oneshot::Sender<Result<Emotion, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Analyse the image at `path` and return its dominant emotion.
    pub async fn dominant_emotion(&self, path: PathBuf) -> Result<Emotion, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::DominantEmotion { path, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread that owns `analyzer`.
///
/// Inference is blocking and needs exclusive access to the ONNX sessions, so
/// requests are served one at a time off the async runtime. The thread exits
/// once every handle has been dropped.
pub fn spawn_engine(mut analyzer: BoxedAnalyzer) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("moodscan-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::DominantEmotion { path, reply } => {
                        let _ = reply.send(run_analysis(analyzer.as_mut(), &path));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

/// Run one analysis, turning a panic into an error so the engine thread
/// keeps serving later requests.
fn run_analysis(
    analyzer: &mut (dyn EmotionAnalyzer + Send),
    path: &Path,
) -> Result<Emotion, EngineError> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        moodscan_core::dominant_emotion(analyzer, path)
    }));

    match outcome {
        Ok(Ok(emotion)) => Ok(emotion),
        Ok(Err(err)) => {
            tracing::debug!(path = %path.display(), error = %err, "analysis failed");
            Err(err.into())
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(path = %path.display(), panic = %message, "analyzer panicked");
            Err(EngineError::Panicked(message))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use moodscan_core::{
        AnalysisError, AnalyzeOptions, EmotionAnalyzer, EmotionScores, FaceAnalysis, FaceRegion,
    };
    use std::path::Path;

    /// Decodes the file like a real analyzer would, then reports fixed scores.
    pub struct DecodingAnalyzer {
        pub probabilities: [f32; 7],
    }

    impl DecodingAnalyzer {
        pub fn happy() -> Self {
            Self { probabilities: [0.02, 0.01, 0.02, 0.85, 0.03, 0.02, 0.05] }
        }
    }

    impl EmotionAnalyzer for DecodingAnalyzer {
        fn analyze(
            &mut self,
            path: &Path,
            _options: &AnalyzeOptions,
        ) -> Result<Vec<FaceAnalysis>, AnalysisError> {
            let image = image::ImageReader::open(path)
                .and_then(|r| r.with_guessed_format())
                .map_err(|source| AnalysisError::Io { path: path.to_path_buf(), source })?
                .decode()
                .map_err(|source| AnalysisError::Decode { path: path.to_path_buf(), source })?;

            let region = FaceRegion::full(image.width(), image.height());
            let scores = EmotionScores::from_probabilities(self.probabilities);
            Ok(vec![FaceAnalysis::new(region, 0.0, scores)])
        }
    }

    /// A tiny PNG that any decoder accepts.
    pub fn png_bytes() -> Vec<u8> {
        let mut bytes = Vec::new();
        image::RgbImage::from_pixel(8, 8, image::Rgb([200, 180, 160]))
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .expect("encode png");
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{png_bytes, DecodingAnalyzer};
    use super::*;

    #[tokio::test]
    async fn test_engine_returns_dominant_emotion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.png");
        std::fs::write(&path, png_bytes()).unwrap();

        let engine = spawn_engine(Box::new(DecodingAnalyzer::happy())).unwrap();
        assert_eq!(engine.dominant_emotion(path).await.unwrap(), Emotion::Happy);
    }

    #[tokio::test]
    async fn test_engine_propagates_decode_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.png");
        std::fs::write(&path, b"definitely not an image").unwrap();

        let engine = spawn_engine(Box::new(DecodingAnalyzer::happy())).unwrap();
        let err = engine.dominant_emotion(path).await.unwrap_err();
        assert!(
            matches!(err, EngineError::Analysis(AnalysisError::Decode { .. })),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_engine_handles_are_shared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.png");
        std::fs::write(&path, png_bytes()).unwrap();

        let engine = spawn_engine(Box::new(DecodingAnalyzer::happy())).unwrap();
        let other = engine.clone();
        let (a, b) = tokio::join!(
            engine.dominant_emotion(path.clone()),
            other.dominant_emotion(path)
        );
        assert_eq!(a.unwrap(), Emotion::Happy);
        assert_eq!(b.unwrap(), Emotion::Happy);
    }

    /// Panics on `boom.png`, decodes everything else.
    struct PanicsOnBoom(DecodingAnalyzer);

    impl EmotionAnalyzer for PanicsOnBoom {
        fn analyze(
            &mut self,
            path: &Path,
            options: &moodscan_core::AnalyzeOptions,
        ) -> Result<Vec<moodscan_core::FaceAnalysis>, AnalysisError> {
            if path.ends_with("boom.png") {
                panic!("model session poisoned");
            }
            self.0.analyze(path, options)
        }
    }

    #[tokio::test]
    async fn test_engine_survives_analyzer_panic() {
        let dir = tempfile::tempdir().unwrap();
        let boom = dir.path().join("boom.png");
        let face = dir.path().join("face.png");
        std::fs::write(&boom, png_bytes()).unwrap();
        std::fs::write(&face, png_bytes()).unwrap();

        let engine = spawn_engine(Box::new(PanicsOnBoom(DecodingAnalyzer::happy()))).unwrap();

        let err = engine.dominant_emotion(boom).await.unwrap_err();
        assert!(
            matches!(&err, EngineError::Panicked(msg) if msg == "model session poisoned"),
            "got {err:?}"
        );
        // The thread is still alive and serving.
        assert_eq!(engine.dominant_emotion(face).await.unwrap(), Emotion::Happy);
    }
}
