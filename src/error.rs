//! 统一的 API 错误类型与转换。

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::model::UploadFail;
use crate::registry::BoxError;
use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    Rejected(UploadFail),
    NotFound,
    Internal(String),
    RangeNotSatisfiable(u64),
    Forbidden,
    TooManyRequests(u64),
}

fn detail(code: impl ToString) -> Json<serde_json::Value> {
    Json(json!({ "detail": code.to_string() }))
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Rejected(fail) => (StatusCode::BAD_REQUEST, detail(fail)).into_response(),
            ApiError::NotFound => StatusCode::NOT_FOUND.into_response(),
            ApiError::Internal(msg) => {
                error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
            ApiError::RangeNotSatisfiable(size) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    headers,
                    "range not satisfiable",
                )
                    .into_response()
            }
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "forbidden").into_response(),
            ApiError::TooManyRequests(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    headers,
                    detail(UploadFail::TooFast),
                )
                    .into_response()
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::OutOfBounds { .. } | StorageError::Unsupported(_) => {
                ApiError::Rejected(UploadFail::InvalidFile)
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<BoxError> for ApiError {
    fn from(error: BoxError) -> Self {
        match error {
            BoxError::NotFound => ApiError::NotFound,
            BoxError::Rejected(fail) => ApiError::Rejected(fail),
            BoxError::RateLimited { retry_after } => ApiError::TooManyRequests(retry_after),
            BoxError::Storage(err) => err.into(),
            BoxError::Descriptor(err) => ApiError::Internal(err.to_string()),
        }
    }
}
