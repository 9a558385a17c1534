//! Error types for each layer and their HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("chat {0} not found")]
    NotFound(String),

    #[error("message {0} already stored")]
    DuplicateMessage(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Rejections raised while authenticating or decoding a webhook call.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("missing signature")]
    MissingSignature,

    #[error("signature mismatch")]
    BadSignature,

    #[error("invalid shared token")]
    BadToken,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AnswerError {
    #[error("answer generator timed out")]
    Timeout,

    #[error("answer generator is not configured")]
    NotConfigured,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("malformed answer: {0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("no delivery credentials for {0}")]
    NotConfigured(&'static str),

    #[error("delivery request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("platform rejected delivery ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0} channel is not configured")]
    ChannelDisabled(&'static str),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Adapter(AdapterError::MalformedPayload(_)) => StatusCode::BAD_REQUEST,
            AppError::Adapter(_) | AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Store(StoreError::NotFound(_)) | AppError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            AppError::Store(StoreError::DuplicateMessage(_)) => StatusCode::CONFLICT,
            AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::ChannelDisabled(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Database detail stays in the logs.
        let message = match &self {
            AppError::Store(StoreError::Database(_))
            | AppError::Store(StoreError::Migration(_))
            | AppError::Store(StoreError::Corrupt(_)) => "internal storage error".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_failures_map_to_client_errors() {
        assert_eq!(
            AppError::from(AdapterError::BadSignature).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::from(AdapterError::MissingSignature).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::from(AdapterError::MalformedPayload("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn store_failures_map_to_server_errors() {
        assert_eq!(
            AppError::from(StoreError::NotFound("c1".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(StoreError::Corrupt("bad role".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
