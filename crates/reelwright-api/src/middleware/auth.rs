// SPDX-License-Identifier: GPL-3.0-or-later
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::handlers::ErrorResponse;
use crate::ApiState;

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("X-Api-Key").and_then(|v| v.to_str().ok()) {
        return Some(key);
    }
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Validates the `X-Api-Key` header or bearer token against the configured
/// key. Without a configured key every request passes.
pub async fn auth_middleware(
    State(state): State<ApiState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };

    match presented_key(&headers) {
        Some(key) if bool::from(key.as_bytes().ct_eq(expected.as_bytes())) => {
            next.run(request).await
        }
        Some(_) => {
            debug!(target: "auth", "rejected request with a wrong api key");
            unauthorized()
        }
        None => {
            debug!(target: "auth", "rejected request without credentials");
            unauthorized()
        }
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: "missing or invalid api key".to_string(),
        }),
    )
        .into_response()
}
