//! HTTP error responses
//!
//! Every handler returns `Result<_, ApiError>`; the variant decides the
//! status code and the body is always `{ "error": kind, "message": text }`.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use brunnen_core::auth::AuthError;
use brunnen_core::protocol::PayloadError;
use brunnen_core::store::StoreError;
use brunnen_core::sync::SyncError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    /// Device credentials missing or wrong; answered with a Basic challenge
    #[error("Wrong credentials")]
    WrongCredentials,

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("Database error: {0}")]
    BadGateway(#[from] StoreError),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::WrongCredentials | ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::WrongCredentials | ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Unprocessable(_) => "unprocessable_entity",
            ApiError::BadGateway(_) => "bad_gateway",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl From<PayloadError> for ApiError {
    fn from(e: PayloadError) -> Self {
        match e {
            PayloadError::InvalidParameter { .. } | PayloadError::MissingField("select") => {
                ApiError::BadRequest(e.to_string())
            }
            _ => ApiError::Unprocessable(e.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidCredentials | AuthError::TokenExpired | AuthError::MalformedHeader => {
                ApiError::Unauthorized(e.to_string())
            }
            AuthError::EncodingError(_) | AuthError::Hash(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        ApiError::Unprocessable(e.to_string())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        use serde_json::error::Category;
        match e.classify() {
            Category::Data => ApiError::Unprocessable(e.to_string()),
            Category::Syntax | Category::Eof | Category::Io => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            ApiError::BadGateway(e) => tracing::error!("Database request failed: {}", e),
            ApiError::Internal(msg) => tracing::error!("Internal error: {}", msg),
            _ => tracing::debug!("Request failed with {}: {}", status, self),
        }

        let body = serde_json::json!({
            "error": self.kind(),
            "message": self.to_string(),
        });

        let mut response = (status, Json(body)).into_response();
        if matches!(self, ApiError::WrongCredentials) {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"brunnen\""),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_error_mapping() {
        let err: ApiError = PayloadError::MissingParameter("start").into();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let err: ApiError = PayloadError::MissingField("select").into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err: ApiError = PayloadError::InvertedRange.into();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_json_error_mapping() {
        let syntax = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(ApiError::from(syntax).status(), StatusCode::BAD_REQUEST);

        let data = serde_json::from_str::<Vec<u8>>(r#"{"a":1}"#).unwrap_err();
        assert_eq!(ApiError::from(data).status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_device_challenge_header() {
        let response = ApiError::WrongCredentials.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

        let response = ApiError::BadGateway(StoreError::AuthFailed).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
