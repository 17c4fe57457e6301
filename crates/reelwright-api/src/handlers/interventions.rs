// SPDX-License-Identifier: GPL-3.0-or-later
use axum::{
    extract::{Path, State},
    Json,
};
use reelwright_application::{ResolutionAction, ResolutionDecision, ResolutionOverrides};
use reelwright_domain::{PipelineState, SourceRef, TranscodeSpec};
use serde::Deserialize;
use tracing::info;
use utoipa::ToSchema;

use super::{parse_id, ApiError, ErrorResponse, ReleaseResponse};
use crate::ApiState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResolveRequest {
    /// `resume` or `abandon`.
    pub action: String,
    /// Stage to resume at, e.g. `downloading` or `decided`.
    pub target: Option<String>,
    /// Replacement source reference. Only valid when resuming before verification.
    pub source_ref: Option<String>,
    /// Manual keep/drop/create plan replacing the computed one.
    #[schema(value_type = Option<Object>)]
    pub spec: Option<TranscodeSpec>,
}

impl ResolveRequest {
    fn into_decision(self) -> Result<ResolutionDecision, ApiError> {
        let action = match self.action.as_str() {
            "abandon" => ResolutionAction::Abandon,
            "resume" => {
                let raw = self
                    .target
                    .ok_or_else(|| ApiError::bad_request("resume requires a target stage"))?;
                let target = raw
                    .parse::<PipelineState>()
                    .map_err(|_| ApiError::bad_request(format!("unknown stage: {raw}")))?;
                ResolutionAction::Resume { target }
            }
            other => return Err(ApiError::bad_request(format!("unknown action: {other}"))),
        };
        Ok(ResolutionDecision {
            action,
            overrides: ResolutionOverrides {
                source_ref: self
                    .source_ref
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .map(SourceRef::new),
                spec: self.spec,
            },
        })
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/interventions",
    responses(
        (status = 200, description = "Releases awaiting an operator, oldest first", body = [ReleaseResponse])
    ),
    tag = "interventions"
)]
pub async fn list_interventions(
    State(state): State<ApiState>,
) -> Result<Json<Vec<ReleaseResponse>>, ApiError> {
    let pending = state.services.coordinator.list_pending().await?;
    Ok(Json(pending.iter().map(ReleaseResponse::from).collect()))
}

#[utoipa::path(
    post,
    path = "/api/v1/interventions/{id}/resolve",
    params(("id" = String, Path, description = "Release id")),
    request_body = ResolveRequest,
    responses(
        (status = 200, description = "Resolution applied", body = ReleaseResponse),
        (status = 400, description = "Malformed request", body = ErrorResponse),
        (status = 404, description = "Release not found", body = ErrorResponse),
        (status = 409, description = "Release is leased by a worker", body = ErrorResponse),
        (status = 422, description = "Resolution not applicable to the release", body = ErrorResponse)
    ),
    tag = "interventions"
)]
pub async fn resolve_intervention(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    let id = parse_id(&id)?;
    let decision = request.into_decision()?;
    let release = state.services.coordinator.resolve(id, decision).await?;
    info!(target: "api", release_id = %id, state = %release.state, "intervention resolved");
    Ok(Json(ReleaseResponse::from(&release)))
}
