use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::engine::EngineError;

/// Prefix every server-side failure carries in its `detail`.
pub const SERVER_ERROR_PREFIX: &str = "Something went wrong: ";

#[derive(Error, Debug)]
pub enum ApiError {
    /// The request body is not a readable multipart form.
    #[error("{}", .0.body_text())]
    Multipart(#[from] MultipartError),
    /// The request is not `multipart/form-data` at all.
    #[error("{}", .0.body_text())]
    NotMultipart(#[from] MultipartRejection),
    #[error("{0}")]
    BadRequest(String),
    #[error("{source}: {}", .path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// JSON error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Multipart(err) => err.status(),
            ApiError::NotMultipart(rejection) => rejection.status(),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Storage { .. } | ApiError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            format!("{SERVER_ERROR_PREFIX}{self}")
        } else {
            tracing::warn!(status = status.as_u16(), error = %self, "rejected request");
            self.to_string()
        };

        (status, Json(ErrorResponse { detail })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moodscan_core::AnalysisError;

    async fn body_of(err: ApiError) -> (StatusCode, ErrorResponse) {
        let response = err.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_storage_error_is_generic_server_error() {
        let err = ApiError::Storage {
            path: PathBuf::from("storage/app/private/a.png"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
        };
        let (status, body) = body_of(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body.detail,
            "Something went wrong: No such file or directory: storage/app/private/a.png"
        );
    }

    #[tokio::test]
    async fn test_analysis_error_is_generic_server_error() {
        let err = ApiError::Engine(EngineError::Analysis(AnalysisError::EmptyResult));
        let (status, body) = body_of(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.detail, "Something went wrong: analysis returned no results");
    }

    #[tokio::test]
    async fn test_bad_request_has_no_prefix() {
        let err = ApiError::BadRequest("missing multipart field \"file\"".into());
        let (status, body) = body_of(err).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.detail.starts_with(SERVER_ERROR_PREFIX));
    }
}
