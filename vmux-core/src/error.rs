//! Closed error taxonomy for the compute orchestration core.
//!
//! Every fallible operation in this crate returns [`Error`]. The variant set
//! is fixed: components never invent new codes, they pick the variant whose
//! abstract kind matches and attach a message. `IntoResponse` maps each
//! variant to the HTTP status and SCREAMING_SNAKE code it carries on the
//! wire.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of error kinds surfaced by the core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("token expired")]
    TokenExpired,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("insufficient storage: {0}")]
    InsufficientStorage(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("canceled")]
    Canceled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The stable SCREAMING_SNAKE code carried on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::InvalidParameter(_) => "INVALID_PARAMETER",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::Forbidden(_) => "FORBIDDEN",
            Error::InvalidCredentials => "INVALID_CREDENTIALS",
            Error::TokenExpired => "TOKEN_EXPIRED",
            Error::InvalidToken(_) => "INVALID_TOKEN",
            Error::InsufficientStorage(_) => "INSUFFICIENT_STORAGE",
            Error::Unsupported(_) => "UNSUPPORTED",
            Error::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            Error::Conflict(_) => "CONFLICT",
            Error::Timeout(_) => "TIMEOUT",
            Error::Canceled => "CANCELED",
            Error::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) | Error::Conflict(_) => StatusCode::CONFLICT,
            Error::InvalidParameter(_) | Error::InvalidState(_) | Error::InsufficientStorage(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Unauthorized(_)
            | Error::InvalidCredentials
            | Error::InvalidToken(_)
            | Error::TokenExpired => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Unsupported(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Canceled => StatusCode::from_u16(499).expect("valid status code"),
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub status: u16,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        match &self {
            Error::Internal(msg) => tracing::error!(code, %msg, "internal error"),
            Error::BackendUnavailable(msg) => tracing::error!(code, %msg, "backend unavailable"),
            Error::Timeout(msg) => tracing::warn!(code, %msg, "operation timed out"),
            other => tracing::debug!(code, error = %other, "request rejected"),
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
            status: status.as_u16(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Error::Internal(format!("configuration error: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(format!("I/O error: {e}"))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Error::NotFound("record not found".into()),
            other => Error::Internal(format!("database error: {other}")),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match e.kind() {
            ErrorKind::ExpiredSignature => Error::TokenExpired,
            _ => Error::InvalidToken(e.to_string()),
        }
    }
}

impl From<minijinja::Error> for Error {
    fn from(e: minijinja::Error) -> Self {
        Error::Internal(format!("template render error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_spec_table() {
        assert_eq!(Error::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(Error::AlreadyExists("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(Error::InvalidParameter("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::InvalidState("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::Unauthorized("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(Error::InvalidCredentials.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::TokenExpired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::InvalidToken("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(Error::InsufficientStorage("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(Error::Unsupported("x".into()).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(Error::BackendUnavailable("x".into()).status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(Error::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(Error::Timeout("x".into()).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(Error::Canceled.status().as_u16(), 499);
        assert_eq!(Error::Internal("x".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn codes_are_screaming_snake() {
        assert_eq!(Error::NotFound("x".into()).code(), "NOT_FOUND");
        assert_eq!(Error::InsufficientStorage("x".into()).code(), "INSUFFICIENT_STORAGE");
        assert_eq!(Error::TokenExpired.code(), "TOKEN_EXPIRED");
    }
}
