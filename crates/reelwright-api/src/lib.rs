// SPDX-License-Identifier: GPL-3.0-or-later
pub mod handlers;
pub mod middleware;

use axum::{middleware as axum_middleware, routing::get, routing::post, Json, Router};
use handlers::interventions::{
    list_interventions, resolve_intervention, ResolveRequest, __path_list_interventions,
    __path_resolve_intervention,
};
use handlers::releases::{
    cancel_release, create_release, get_release, list_releases, CancelResponse,
    CreateReleaseRequest, __path_cancel_release, __path_create_release, __path_get_release,
    __path_list_releases,
};
use handlers::{ErrorResponse, FailureResponse, HistoryResponse, ReleaseResponse};
use middleware::auth::auth_middleware;
use reelwright_application::Services;
use serde::Serialize;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(Clone)]
pub struct ApiState {
    pub services: Services,
    /// Shared key required on `/api/v1`; `None` leaves the API open.
    pub api_key: Option<String>,
}

impl ApiState {
    pub fn new(services: Services, api_key: Option<String>) -> Self {
        Self {
            services,
            api_key: api_key.filter(|key| !key.is_empty()),
        }
    }
}

#[derive(Serialize, utoipa::ToSchema)]
struct HealthResponse {
    status: &'static str,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        create_release,
        list_releases,
        get_release,
        cancel_release,
        list_interventions,
        resolve_intervention,
    ),
    components(
        schemas(
            HealthResponse,
            ReleaseResponse,
            HistoryResponse,
            FailureResponse,
            CreateReleaseRequest,
            CancelResponse,
            ResolveRequest,
            ErrorResponse,
        )
    ),
    tags(
        (name = "system", description = "System health and status endpoints"),
        (name = "releases", description = "Submitting and tracking releases"),
        (name = "interventions", description = "Releases awaiting an operator")
    ),
    info(
        title = "Reelwright API",
        version = "0.1.0",
        description = "Film acquisition and library placement pipeline",
    )
)]
struct ApiDoc;

pub fn router(state: ApiState) -> Router {
    info!(target: "api", auth = state.api_key.is_some(), "building router");

    let api_v1 = Router::new()
        .route("/releases", get(list_releases).post(create_release))
        .route("/releases/:id", get(get_release))
        .route("/releases/:id/cancel", post(cancel_release))
        .route("/interventions", get(list_interventions))
        .route("/interventions/:id/resolve", post(resolve_intervention))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let openapi = ApiDoc::openapi();

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_v1)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", openapi))
        .with_state(state)
}
