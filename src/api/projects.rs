// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Project API endpoints.
//!
//! Every call is scoped to the authenticated user. Projects owned by someone
//! else are reported exactly like projects that do not exist.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::{
    auth::Auth,
    error::ApiError,
    generation::GenerationError,
    projects::{ProjectError, ProjectExport, ProjectView, StageWrite},
    session::{ProjectRecord, SlotName},
    state::AppState,
    validation::BatchValidation,
};

/// Request to create a project.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateProjectRequest {
    /// Display name.
    pub name: String,
    /// Persist encrypted copies across restarts. Defaults to memory-only.
    #[serde(default)]
    pub persistent: bool,
    /// Overrides the mode's default lifetime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Output of one pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StageOutputRequest {
    #[schema(value_type = Object)]
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GenerateStageRequest {
    /// Free-form instructions appended to the stage prompt.
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ExportRequest {
    /// Delete the project once the export document is built.
    #[serde(default)]
    pub delete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeleteProjectResponse {
    pub project_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PurgeDurableResponse {
    pub project_id: String,
    /// `false` when there was no durable copy to remove.
    pub purged: bool,
}

fn parse_slot(raw: &str) -> Result<SlotName, ApiError> {
    SlotName::parse(raw).ok_or_else(|| ApiError::bad_request(format!("Unknown stage: {raw}")))
}

/// Create a project for the authenticated user.
#[utoipa::path(
    post,
    path = "/v1/projects",
    tag = "Projects",
    security(("bearer_auth" = [])),
    request_body = CreateProjectRequest,
    responses(
        (status = 201, description = "Project created", body = ProjectRecord),
        (status = 400, description = "Invalid request"),
        (status = 401, description = "Unauthorized"),
        (status = 500, description = "Key provisioning or storage failed")
    )
)]
pub async fn create_project(
    Auth(user): Auth,
    State(state): State<AppState>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<ProjectRecord>), ApiError> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("Project name is required"));
    }

    let record = state
        .projects
        .create_project(&user.user_id, name, request.persistent, request.expires_at)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// List the user's projects, partitioned into valid and problematic ones.
#[utoipa::path(
    get,
    path = "/v1/projects",
    tag = "Projects",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Projects with validation results", body = BatchValidation),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn list_projects(
    Auth(user): Auth,
    State(state): State<AppState>,
) -> Result<Json<BatchValidation>, ApiError> {
    Ok(Json(state.projects.list_projects(&user.user_id).await?))
}

/// Fetch a project. Slot contents are withheld when the display gate fails.
#[utoipa::path(
    get,
    path = "/v1/projects/{project_id}",
    tag = "Projects",
    security(("bearer_auth" = [])),
    params(("project_id" = String, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Project and display decision", body = ProjectView),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Project not found")
    )
)]
pub async fn get_project(
    Auth(user): Auth,
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectView>, ApiError> {
    Ok(Json(state.projects.get_project(&user.user_id, &project_id).await?))
}

#[utoipa::path(
    delete,
    path = "/v1/projects/{project_id}",
    tag = "Projects",
    security(("bearer_auth" = [])),
    params(("project_id" = String, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Project deleted", body = DeleteProjectResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Project not found")
    )
)]
pub async fn delete_project(
    Auth(user): Auth,
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<DeleteProjectResponse>, ApiError> {
    if !state.projects.delete_project(&user.user_id, &project_id)? {
        return Err(ApiError::not_found("Project not found"));
    }
    Ok(Json(DeleteProjectResponse {
        project_id,
        message: "Project deleted".to_string(),
    }))
}

/// Store the output of one stage. Charged once per successful write.
#[utoipa::path(
    put,
    path = "/v1/projects/{project_id}/slots/{slot}",
    tag = "Projects",
    security(("bearer_auth" = [])),
    params(
        ("project_id" = String, Path, description = "Project ID"),
        ("slot" = String, Path, description = "idea, research, blueprint, financial, pitch or gtm")
    ),
    request_body = StageOutputRequest,
    responses(
        (status = 200, description = "Stage stored and charged", body = StageWrite),
        (status = 400, description = "Unknown stage"),
        (status = 402, description = "Insufficient credits"),
        (status = 404, description = "Project not found"),
        (status = 409, description = "Previous stage not completed"),
        (status = 422, description = "Null value")
    )
)]
pub async fn put_stage_output(
    Auth(user): Auth,
    State(state): State<AppState>,
    Path((project_id, slot)): Path<(String, String)>,
    Json(request): Json<StageOutputRequest>,
) -> Result<Json<StageWrite>, ApiError> {
    let slot = parse_slot(&slot)?;
    let write = state
        .projects
        .write_stage_output(&user.user_id, &project_id, slot, request.value)
        .await?;
    Ok(Json(write))
}

/// Run the generator for a stage and store its output.
#[utoipa::path(
    post,
    path = "/v1/projects/{project_id}/stages/{slot}/generate",
    tag = "Projects",
    security(("bearer_auth" = [])),
    params(
        ("project_id" = String, Path, description = "Project ID"),
        ("slot" = String, Path, description = "Stage to generate")
    ),
    request_body = GenerateStageRequest,
    responses(
        (status = 200, description = "Stage generated, stored and charged", body = StageWrite),
        (status = 402, description = "Insufficient credits"),
        (status = 404, description = "Project not found"),
        (status = 409, description = "Previous stage not completed"),
        (status = 502, description = "Generator returned unusable output"),
        (status = 503, description = "Generator unavailable or not configured")
    )
)]
pub async fn generate_stage(
    Auth(user): Auth,
    State(state): State<AppState>,
    Path((project_id, slot)): Path<(String, String)>,
    Json(request): Json<GenerateStageRequest>,
) -> Result<Json<StageWrite>, ApiError> {
    let slot = parse_slot(&slot)?;
    let generator = state
        .generator
        .as_ref()
        .ok_or(ProjectError::Generation(GenerationError::NotConfigured))?;

    let write = state
        .projects
        .generate_stage(
            &user.user_id,
            &project_id,
            slot,
            &request.prompt,
            generator.as_ref(),
            &state.retry,
        )
        .await?;
    Ok(Json(write))
}

/// Export a project as a self-contained document.
#[utoipa::path(
    post,
    path = "/v1/projects/{project_id}/export",
    tag = "Projects",
    security(("bearer_auth" = [])),
    params(("project_id" = String, Path, description = "Project ID")),
    request_body = ExportRequest,
    responses(
        (status = 200, description = "Export document", body = ProjectExport),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Project not found")
    )
)]
pub async fn export_project(
    Auth(user): Auth,
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<ExportRequest>,
) -> Result<Json<ProjectExport>, ApiError> {
    let export = state
        .projects
        .export_project(&user.user_id, &project_id, request.delete)
        .await?;
    Ok(Json(export))
}

/// Remove a durable copy held for a memory-only project.
#[utoipa::path(
    delete,
    path = "/v1/projects/{project_id}/durable",
    tag = "Projects",
    security(("bearer_auth" = [])),
    params(("project_id" = String, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Durable copy handled", body = PurgeDurableResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Project not found")
    )
)]
pub async fn purge_durable_copy(
    Auth(user): Auth,
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<Json<PurgeDurableResponse>, ApiError> {
    let purged = state
        .projects
        .purge_durable_copy(&user.user_id, &project_id)?;
    Ok(Json(PurgeDurableResponse { project_id, purged }))
}
