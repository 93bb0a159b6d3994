//! HTTP surface: `/predict` upload handler, health probe, and server lifecycle.

use anyhow::Context;
use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::TryStreamExt;
use moodscan_core::DetectorBackend;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::error::ApiError;
use crate::upload::{self, FilenamePolicy, UploadRecord};

/// Multipart field that carries the image.
pub const UPLOAD_FIELD: &str = "file";

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    engine: EngineHandle,
    storage_dir: Arc<Path>,
    filename_policy: FilenamePolicy,
    detector: DetectorBackend,
}

impl AppState {
    pub fn new(config: &Config, engine: EngineHandle) -> Self {
        Self {
            engine,
            storage_dir: Arc::from(config.storage_dir.as_path()),
            filename_policy: config.filename_policy,
            detector: config.detector,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictResponse {
    pub success: String,
    pub result: String,
}

/// Build the router with CORS, tracing and the configured body limit.
pub fn create_router(state: AppState, config: &Config) -> Router {
    let body_limit = match config.max_upload_bytes {
        Some(limit) => DefaultBodyLimit::max(limit),
        None => DefaultBodyLimit::disable(),
    };

    Router::new()
        .route("/predict", post(predict))
        .route("/health", get(health))
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(config))
        .with_state(state)
}

/// POST-only CORS. With no explicit origins every origin is reflected, which
/// keeps credentials usable where a literal `*` would be rejected by browsers.
fn cors_layer(config: &Config) -> CorsLayer {
    let origin = if config.cors_origins.is_empty() {
        AllowOrigin::mirror_request()
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| match o.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::POST])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(config.cors_allow_credentials)
}

/// Store the uploaded image, analyse it, and report its dominant emotion.
///
/// The multipart stream is owned by this handler and dropped on every return
/// path, success or error.
async fn predict(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    let mut multipart = multipart?;
    let upload = receive_upload(&state, &mut multipart).await?;
    let emotion = state.engine.dominant_emotion(upload.path.clone()).await?;

    tracing::info!(
        filename = %upload.filename,
        bytes = upload.bytes,
        emotion = %emotion,
        "prediction complete"
    );

    Ok(Json(PredictResponse {
        success: format!("Successfully uploaded {}", upload.filename),
        result: emotion.to_string(),
    }))
}

/// Find the upload field and stream it to the storage directory.
async fn receive_upload(
    state: &AppState,
    multipart: &mut Multipart,
) -> Result<UploadRecord, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let filename = field.file_name().map(str::to_string).ok_or_else(|| {
            ApiError::BadRequest(format!("multipart field {UPLOAD_FIELD:?} has no filename"))
        })?;
        let path = upload::storage_path(&state.storage_dir, &filename, state.filename_policy)
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;

        let reader = StreamReader::new(field.map_err(std::io::Error::other));
        let bytes = upload::persist_upload(std::pin::pin!(reader), &path)
            .await
            .map_err(|err| upload_failure(&path, err))?;

        tracing::debug!(filename = %filename, path = %path.display(), bytes, "upload stored");
        return Ok(UploadRecord { filename, path, bytes });
    }

    Err(ApiError::BadRequest(format!("missing multipart field {UPLOAD_FIELD:?}")))
}

/// Body read failures keep their multipart status; anything else is storage.
fn upload_failure(path: &Path, err: std::io::Error) -> ApiError {
    if !err.get_ref().is_some_and(|inner| inner.is::<MultipartError>()) {
        return ApiError::Storage { path: path.to_path_buf(), source: err };
    }
    match err.into_inner().map(|inner| inner.downcast::<MultipartError>()) {
        Some(Ok(multipart)) => ApiError::Multipart(*multipart),
        _ => ApiError::BadRequest("failed to read upload body".to_string()),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub detector: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        detector: state.detector.to_string(),
    })
}

/// A bound, not yet serving, HTTP server.
pub struct Server {
    listener: TcpListener,
    router: Router,
    storage_dir: PathBuf,
}

impl Server {
    /// Create the storage directory and bind the listener.
    pub async fn bind(config: &Config, engine: EngineHandle) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.storage_dir)
            .await
            .with_context(|| {
                format!("failed to create storage directory {}", config.storage_dir.display())
            })?;

        let router = create_router(AppState::new(config, engine), config);
        let address = config.bind_address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to bind {address}"))?;

        Ok(Self {
            listener,
            router,
            storage_dir: config.storage_dir.clone(),
        })
    }

    /// Start serving in a background task.
    pub fn start(self) -> std::io::Result<RunningServer> {
        let local_addr = self.listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tracing::info!(
            address = %local_addr,
            storage_dir = %self.storage_dir.display(),
            "moodscand listening"
        );

        let task = tokio::spawn(async move {
            axum::serve(self.listener, self.router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(RunningServer {
            local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle to a serving [`Server`].
pub struct RunningServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections, let in-flight requests finish, and wait.
    pub async fn stop(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(());
        self.task
            .await
            .context("server task panicked")?
            .context("server exited with an error")?;
        tracing::info!(address = %self.local_addr, "moodscand stopped");
        Ok(())
    }
}
