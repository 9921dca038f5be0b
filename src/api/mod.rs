// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    projects::{
        AccountErasure, ExportAttestation, ExportedProjectMetadata, ProjectExport, ProjectView,
        StageWrite,
    },
    session::{ProjectRecord, ProjectSlots, SessionStats, SlotName, StorageMode},
    state::AppState,
    storage::{UsageAction, UsageRecord},
    validation::{
        BatchValidation, DisplayDecision, ProblematicProject, ProjectValidation,
        RecommendedAction, ValidationSummary,
    },
};

pub mod account;
pub mod health;
pub mod projects;

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route(
            "/projects",
            get(projects::list_projects).post(projects::create_project),
        )
        .route(
            "/projects/{project_id}",
            get(projects::get_project).delete(projects::delete_project),
        )
        .route(
            "/projects/{project_id}/slots/{slot}",
            put(projects::put_stage_output),
        )
        .route(
            "/projects/{project_id}/stages/{slot}/generate",
            post(projects::generate_stage),
        )
        .route(
            "/projects/{project_id}/export",
            post(projects::export_project),
        )
        .route(
            "/projects/{project_id}/durable",
            delete(projects::purge_durable_copy),
        )
        .route("/account", delete(account::delete_account))
        .route("/account/credits", get(account::get_credits))
        .route("/account/usage", get(account::get_usage));

    Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .nest("/v1", v1_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CorsLayer::permissive())
}

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        health::liveness,
        health::readiness,
        projects::create_project,
        projects::list_projects,
        projects::get_project,
        projects::delete_project,
        projects::put_stage_output,
        projects::generate_stage,
        projects::export_project,
        projects::purge_durable_copy,
        account::get_credits,
        account::get_usage,
        account::delete_account
    ),
    components(
        schemas(
            health::ReadyResponse,
            health::HealthChecks,
            health::HealthResponse,
            projects::CreateProjectRequest,
            projects::StageOutputRequest,
            projects::GenerateStageRequest,
            projects::ExportRequest,
            projects::DeleteProjectResponse,
            projects::PurgeDurableResponse,
            account::CreditBalanceResponse,
            account::UsageHistoryResponse,
            account::DeleteAccountResponse,
            ProjectRecord,
            ProjectSlots,
            SlotName,
            StorageMode,
            SessionStats,
            ProjectView,
            StageWrite,
            ProjectExport,
            ExportedProjectMetadata,
            ExportAttestation,
            AccountErasure,
            UsageRecord,
            UsageAction,
            BatchValidation,
            ProblematicProject,
            ProjectValidation,
            ValidationSummary,
            RecommendedAction,
            DisplayDecision
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "Health", description = "Liveness and readiness checks"),
        (name = "Projects", description = "Pipeline projects and stage outputs"),
        (name = "Account", description = "Credits, usage trail and erasure")
    )
)]
struct ApiDoc;
