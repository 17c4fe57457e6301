// SPDX-License-Identifier: GPL-3.0-or-later
pub mod interventions;
pub mod releases;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use reelwright_application::{CoordinatorError, PipelineError};
use reelwright_domain::{Failure, HistoryEntry, Release, ReleaseId};
use reelwright_infrastructure::StoreError;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::error;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Handler error carrying the status it maps to.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(id: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("release {id} not found"))
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        error!(target: "api", error = %err, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::not_found(id),
            other => Self::internal(other),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidRelease(message) => Self::bad_request(message),
            PipelineError::Store(err) => err.into(),
            other => Self::internal(other),
        }
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::InvalidResolution(message) => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
            }
            CoordinatorError::NotFound(id) => Self::not_found(id),
            CoordinatorError::Busy(id) => {
                Self::new(StatusCode::CONFLICT, format!("release {id} is being worked on"))
            }
            CoordinatorError::Store(err) => err.into(),
        }
    }
}

pub fn parse_id(raw: &str) -> Result<ReleaseId, ApiError> {
    ReleaseId::parse(raw).map_err(|_| ApiError::bad_request(format!("invalid release id: {raw}")))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HistoryResponse {
    pub at: String,
    pub state: String,
    pub note: String,
}

impl From<&HistoryEntry> for HistoryResponse {
    fn from(entry: &HistoryEntry) -> Self {
        Self {
            at: entry.at.to_rfc3339(),
            state: entry.state.to_string(),
            note: entry.note.clone(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FailureResponse {
    pub stage: String,
    pub reason: String,
    pub attempt: u32,
    pub message: String,
    pub at: String,
}

impl From<&Failure> for FailureResponse {
    fn from(failure: &Failure) -> Self {
        Self {
            stage: failure.stage.to_string(),
            reason: failure.reason.to_string(),
            attempt: failure.attempt,
            message: failure.message.clone(),
            at: failure.at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReleaseResponse {
    pub id: String,
    pub source_ref: String,
    pub title: String,
    pub year: Option<u16>,
    pub edition: Option<String>,
    pub primary_language: String,
    pub state: String,
    pub attempts: BTreeMap<String, u32>,
    pub expected_size: Option<u64>,
    pub local_path: Option<String>,
    pub final_path: Option<String>,
    pub resolution: Option<String>,
    pub track_count: usize,
    /// Keep/drop/create plan, as computed or as overridden by an operator.
    #[schema(value_type = Option<Object>)]
    pub decision: Option<serde_json::Value>,
    pub failure: Option<FailureResponse>,
    pub cancel_requested: bool,
    pub next_attempt_at: Option<String>,
    pub history: Vec<HistoryResponse>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&Release> for ReleaseResponse {
    fn from(release: &Release) -> Self {
        Self {
            id: release.id.to_string(),
            source_ref: release.source_ref.to_string(),
            title: release.metadata.title.clone(),
            year: release.metadata.year,
            edition: release.metadata.edition.clone(),
            primary_language: release.metadata.primary_language.clone(),
            state: release.state.to_string(),
            attempts: release
                .attempts
                .iter()
                .map(|(stage, count)| (stage.to_string(), *count))
                .collect(),
            expected_size: release.expected_size,
            local_path: release.local_path.as_ref().map(|p| p.display().to_string()),
            final_path: release.final_path.as_ref().map(|p| p.display().to_string()),
            resolution: release.resolution.map(|r| r.dir_name().to_string()),
            track_count: release.tracks.len(),
            decision: release
                .decision
                .as_ref()
                .and_then(|d| serde_json::to_value(d).ok()),
            failure: release.failure.as_ref().map(FailureResponse::from),
            cancel_requested: release.cancel_requested,
            next_attempt_at: release.next_attempt_at.map(|at| at.to_rfc3339()),
            history: release.history.iter().map(HistoryResponse::from).collect(),
            created_at: release.created_at.to_rfc3339(),
            updated_at: release.updated_at.to_rfc3339(),
        }
    }
}
