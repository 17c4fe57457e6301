// SPDX-License-Identifier: GPL-3.0-or-later
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use reelwright_application::{CancelOutcome, NewRelease};
use reelwright_domain::{PipelineState, ReleaseMetadata, SourceRef};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use super::{parse_id, ApiError, ErrorResponse, ReleaseResponse};
use crate::ApiState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateReleaseRequest {
    /// Hoster link or other reference the resolution service understands.
    pub source_ref: String,
    pub title: String,
    pub year: Option<u16>,
    pub edition: Option<String>,
    /// Declared language of the film, e.g. `fra`.
    pub primary_language: String,
    pub expected_size: Option<u64>,
    /// SHA-256, hex encoded.
    pub expected_checksum: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListReleasesQuery {
    pub state: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CancelResponse {
    pub id: String,
    pub outcome: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/releases",
    request_body = CreateReleaseRequest,
    responses(
        (status = 201, description = "Release queued", body = ReleaseResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse)
    ),
    tag = "releases"
)]
pub async fn create_release(
    State(state): State<ApiState>,
    Json(request): Json<CreateReleaseRequest>,
) -> Result<(StatusCode, Json<ReleaseResponse>), ApiError> {
    let release = state
        .services
        .pipeline
        .submit(NewRelease {
            source_ref: SourceRef::new(request.source_ref.trim()),
            metadata: ReleaseMetadata {
                title: request.title,
                year: request.year,
                edition: request.edition.filter(|e| !e.trim().is_empty()),
                primary_language: request.primary_language.trim().to_string(),
            },
            expected_size: request.expected_size,
            expected_checksum: request.expected_checksum,
        })
        .await?;
    info!(target: "api", release_id = %release.id, "release submitted");
    Ok((StatusCode::CREATED, Json(ReleaseResponse::from(&release))))
}

#[utoipa::path(
    get,
    path = "/api/v1/releases",
    params(ListReleasesQuery),
    responses(
        (status = 200, description = "Releases, newest first", body = [ReleaseResponse]),
        (status = 400, description = "Unknown state filter", body = ErrorResponse)
    ),
    tag = "releases"
)]
pub async fn list_releases(
    State(state): State<ApiState>,
    Query(query): Query<ListReleasesQuery>,
) -> Result<Json<Vec<ReleaseResponse>>, ApiError> {
    let filter = query
        .state
        .as_deref()
        .map(|raw| {
            raw.parse::<PipelineState>()
                .map_err(|_| ApiError::bad_request(format!("unknown state: {raw}")))
        })
        .transpose()?;
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);

    let releases = state.services.store.list(filter, limit, offset).await?;
    Ok(Json(releases.iter().map(ReleaseResponse::from).collect()))
}

#[utoipa::path(
    get,
    path = "/api/v1/releases/{id}",
    params(("id" = String, Path, description = "Release id")),
    responses(
        (status = 200, description = "Release with full history", body = ReleaseResponse),
        (status = 404, description = "Release not found", body = ErrorResponse)
    ),
    tag = "releases"
)]
pub async fn get_release(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    let id = parse_id(&id)?;
    let release = state
        .services
        .store
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found(id))?;
    Ok(Json(ReleaseResponse::from(&release)))
}

#[utoipa::path(
    post,
    path = "/api/v1/releases/{id}/cancel",
    params(("id" = String, Path, description = "Release id")),
    responses(
        (status = 202, description = "Abandoned, or flagged for abandonment at the next checkpoint", body = CancelResponse),
        (status = 404, description = "Release not found", body = ErrorResponse),
        (status = 422, description = "Release already finished", body = ErrorResponse)
    ),
    tag = "releases"
)]
pub async fn cancel_release(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let id = parse_id(&id)?;
    let outcome = state.services.coordinator.request_cancel(id).await?;
    let outcome = match outcome {
        CancelOutcome::Abandoned => "abandoned",
        CancelOutcome::Requested => "requested",
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            id: id.to_string(),
            outcome: outcome.to_string(),
        }),
    ))
}
