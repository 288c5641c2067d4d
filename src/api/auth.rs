//! Shared-secret gate for the registry routes.
//!
//! There are no user accounts. Mutating the registry requires the
//! `X-Admin-Secret` header to equal the configured secret; without a
//! configured secret the gated routes are closed.

use super::routes::ApiErr;
use super::server::ApiState;
use crate::error::AppError;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

/// Header carrying the admin secret.
pub const ADMIN_SECRET_HEADER: &str = "x-admin-secret";

/// Compare without short-circuiting on the first differing byte.
fn secrets_match(expected: &str, provided: &str) -> bool {
    let (a, b) = (expected.as_bytes(), provided.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Middleware for routes that change the registry.
pub async fn require_admin_secret(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(ADMIN_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());

    match (state.settings.server.admin_secret.as_deref(), provided) {
        (Some(expected), Some(provided)) if secrets_match(expected, provided) => {
            next.run(request).await
        }
        (None, _) => {
            log::warn!(
                "[api] Rejected {} {}: no admin secret configured",
                request.method(),
                request.uri().path()
            );
            ApiErr(AppError::authentication("Admin secret is not configured")).into_response()
        }
        _ => {
            log::warn!(
                "[api] Rejected {} {}: missing or invalid admin secret",
                request.method(),
                request.uri().path()
            );
            ApiErr(AppError::authentication("Missing or invalid admin secret")).into_response()
        }
    }
}
