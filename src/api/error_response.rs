//! HTTP error response handling for the API
//!
//! Domain errors become HTTP responses with the status code from
//! [`ToHttpStatus`] and an [`ApiError`] JSON body.

use crate::error::{ApiError, Error, ToHttpStatus};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status_code =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // The body hides internal details; keep them in the log
        if status_code.is_server_error() {
            tracing::error!(error = %self, code = self.error_code(), "API request failed");
        }

        let api_error: ApiError = self.into();
        (status_code, Json(api_error)).into_response()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Errors normally go through Error::into_response, which knows the status
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DownloadError, StorageError};
    use crate::types::TaskId;

    async fn body_of(response: Response) -> ApiError {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_not_found_into_response() {
        let response = Error::NotFound("download task 9".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let api_error = body_of(response).await;
        assert_eq!(api_error.error.code, "not_found");
        assert!(api_error.error.message.contains("download task 9"));
    }

    #[tokio::test]
    async fn test_conflict_into_response() {
        let response = Error::Conflict("task is downloading".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_of(response).await.error.code, "conflict");
    }

    #[tokio::test]
    async fn test_lock_timeout_into_response() {
        let response = Error::LockTimeout { task_id: TaskId(4) }.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let api_error = body_of(response).await;
        assert_eq!(api_error.error.code, "lock_timeout");
        assert_eq!(api_error.error.details.unwrap()["task_id"], 4);
    }

    #[tokio::test]
    async fn test_internal_error_message_is_opaque() {
        let error = Error::Storage(StorageError::Failed {
            key: "task-1".into(),
            reason: "disk on fire at /var/lib/blobs".into(),
        });
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let api_error = body_of(response).await;
        assert_eq!(api_error.error.code, "storage_error");
        assert!(!api_error.error.message.contains("/var/lib/blobs"));
    }

    #[tokio::test]
    async fn test_unsupported_type_is_a_client_error() {
        let response =
            Error::Download(DownloadError::UnsupportedType("unspecified".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
