//! Cross-cutting HTTP middleware: request tracking, header hygiene, and
//! bearer-token authentication.
//!
//! Request ID generation, propagation and sensitive-header masking are
//! copied from the production middleware stack almost unchanged — only the
//! request-id type differs. Auth is new: it resolves an `Authorization:
//! Bearer <token>` header into [`Claims`](crate::auth::Claims) and stores
//! them as a request extension so handlers (and [`require_permission`]) can
//! read them back without re-validating.

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    sensitive_headers::SetSensitiveRequestHeadersLayer,
};

use crate::auth::Claims;
use crate::error::{Error, ErrorResponse};
use crate::ids::MakeTypedRequestId;
use crate::state::AppState;

/// Sensitive headers masked from trace/log output.
pub const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "set-cookie", "x-api-key"];

/// Paths that never require a bearer token. `/auth/refresh` is here too:
/// it validates the token carried in its own request body instead of the
/// `Authorization` header, since a caller refreshes shortly before the old
/// token expires.
const PUBLIC_PATHS: &[&str] = &["/health", "/metrics", "/auth/login", "/auth/refresh"];

/// Generates a type-safe `x-request-id` header for every inbound request.
pub fn request_id_layer() -> SetRequestIdLayer<MakeTypedRequestId> {
    SetRequestIdLayer::x_request_id(MakeTypedRequestId)
}

/// Propagates `x-request-id` from request to response.
pub fn request_id_propagation_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::x_request_id()
}

/// Masks sensitive headers before they reach tracing spans.
pub fn sensitive_headers_layer() -> SetSensitiveRequestHeadersLayer {
    let headers = SENSITIVE_HEADERS.iter().map(|h| h.parse().expect("valid header name")).collect::<Vec<_>>();
    SetSensitiveRequestHeadersLayer::new(headers)
}

/// Validates the bearer token on every request except [`PUBLIC_PATHS`] and
/// WebSocket upgrade requests (those authenticate via a query-string token
/// handled by the hub instead). On success, inserts [`Claims`] as a request
/// extension; on failure, short-circuits with the mapped [`Error`] response.
pub async fn require_auth(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    if !state.config.auth.enabled || PUBLIC_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let header = request.headers().get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());

    let claims = match header {
        Some(value) => match crate::auth::JwtAuth::extract_token(value).and_then(|t| state.jwt_auth.validate_token(t))
        {
            Ok(claims) => claims,
            Err(err) => return err.into_response(),
        },
        None => return Error::Unauthorized("missing Authorization header".into()).into_response(),
    };

    request.extensions_mut().insert(claims);
    next.run(request).await
}

/// Route-level permission gate. Routes wrap this in a closure that captures
/// the permission string and pass it to `axum::middleware::from_fn`
/// (see [`crate::router`]).
pub async fn require_permission(permission: &'static str, request: Request, next: Next) -> Response {
    match request.extensions().get::<Claims>() {
        Some(claims) if claims.has_permission(permission) => next.run(request).await,
        Some(_) => Error::Forbidden(format!("requires '{permission}' permission")).into_response(),
        None => Error::Unauthorized("no authenticated user".into()).into_response(),
    }
}

/// Converts a caught panic into the same JSON error envelope as an ordinary
/// [`Error`], instead of an opaque 500 with no body.
pub fn panic_handler(err: Box<dyn std::any::Any + Send + 'static>) -> Response<Body> {
    let message = if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %message, "request handler panicked");
    let body = ErrorResponse { error: message, code: "INTERNAL_SERVER_ERROR".into(), status: 500 };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_paths_cover_auth_and_health() {
        assert!(PUBLIC_PATHS.contains(&"/health"));
        assert!(PUBLIC_PATHS.contains(&"/auth/login"));
        assert!(PUBLIC_PATHS.contains(&"/auth/refresh"));
        assert!(!PUBLIC_PATHS.contains(&"/api/v1/instances"));
    }

    #[test]
    fn sensitive_headers_include_authorization() {
        assert!(SENSITIVE_HEADERS.contains(&"authorization"));
    }
}
