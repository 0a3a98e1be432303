//! Error types for the Dropgate server

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::auth::{self, AuthError};
use crate::blob::BlobError;
use crate::store::Nonce;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found")]
    NotFound,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized { challenge: Option<Nonce> },

    #[error("Download limit reached")]
    Exhausted { challenge: Option<Nonce> },

    #[error("Server busy")]
    Overloaded,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Blob storage error: {0}")]
    Storage(#[from] BlobError),
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Malformed => {
                AppError::BadRequest("Missing or malformed authorization".into())
            }
            AuthError::NotFound => AppError::NotFound,
            AuthError::Unauthorized { challenge } => AppError::Unauthorized { challenge },
            AuthError::Exhausted { challenge } => AppError::Exhausted {
                challenge: Some(challenge),
            },
        }
    }
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            AppError::NotFound => {
                (StatusCode::NOT_FOUND, "not_found", "File not found".to_string())
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::Unauthorized { .. } => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Invalid credentials".to_string(),
            ),
            AppError::Exhausted { .. } => (
                StatusCode::BAD_REQUEST,
                "limit_reached",
                "Download limit reached".to_string(),
            ),
            AppError::Overloaded => (
                StatusCode::SERVICE_UNAVAILABLE,
                "overloaded",
                "Server busy, try again later".to_string(),
            ),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
            AppError::Storage(e) => {
                tracing::error!("Storage error: {}", e);
                match e {
                    BlobError::NotFound(_) | BlobError::InvalidId(_) => {
                        (StatusCode::NOT_FOUND, "not_found", "File not found".to_string())
                    }
                    BlobError::Io(_) => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "storage_error",
                        "Storage error".to_string(),
                    ),
                }
            }
        };

        let challenge = match &self {
            AppError::Unauthorized { challenge } | AppError::Exhausted { challenge } => *challenge,
            _ => None,
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        let mut response = (status, body).into_response();
        if let Some(nonce) = challenge {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, auth::challenge_value(&nonce));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (AppError::NotFound, StatusCode::NOT_FOUND),
            (AppError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (AppError::Unauthorized { challenge: None }, StatusCode::UNAUTHORIZED),
            (AppError::Exhausted { challenge: None }, StatusCode::BAD_REQUEST),
            (AppError::Overloaded, StatusCode::SERVICE_UNAVAILABLE),
            (AppError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[test]
    fn test_unauthorized_carries_challenge() {
        let nonce = Nonce::random();
        let response = AppError::Unauthorized {
            challenge: Some(nonce),
        }
        .into_response();

        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE),
            Some(&auth::challenge_value(&nonce))
        );

        let response = AppError::Unauthorized { challenge: None }.into_response();
        assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
    }

    #[test]
    fn test_auth_error_conversion() {
        assert!(matches!(AppError::from(AuthError::Malformed), AppError::BadRequest(_)));
        assert!(matches!(AppError::from(AuthError::NotFound), AppError::NotFound));
    }
}
