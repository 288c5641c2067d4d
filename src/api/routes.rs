//! REST routes for the dashboard.

use super::server::ApiState;
use crate::db::sync_log::{self, SyncLogEntry};
use crate::db::task_store::{self, TaskFilter};
use crate::error::AppError;
use crate::models::project::{self, MonitoredProject, ProjectToggle};
use crate::models::{AuditEvent, AuditSummary, TaskWithMetrics};
use crate::services::audit::load_and_compute_audit;
use crate::services::cycle_time::compute_cycle_metrics;
use crate::services::label_discovery::{discover_stage_labels, StageLabelReport};
use crate::services::sync_engine::{RejectReason, RetryPolicy, SyncAdmission, SyncScope, SyncStatus};
use crate::services::wiki_portal::{self, WikiNode, WikiPageContent, WikiProject};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Recent sync log entries returned with the status.
const STATUS_LOG_ENTRIES: i64 = 10;

// ── Error handling ───────────────────────────────────────────────────────────

/// JSON error body.
#[derive(Serialize)]
struct ApiError {
    code: String,
    message: String,
}

/// Wrapper to make AppError usable as an axum error response.
pub struct ApiErr(pub AppError);

impl IntoResponse for ApiErr {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            AppError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::InvalidInput { .. } => (StatusCode::BAD_REQUEST, "INVALID_INPUT"),
            AppError::Authentication { .. } => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            AppError::Conflict { .. } => (StatusCode::CONFLICT, "CONFLICT"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("[api] {}", self.0);
        }
        (
            status,
            Json(ApiError {
                code: code.to_string(),
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<AppError> for ApiErr {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

// ── Request and response types ───────────────────────────────────────────────

#[derive(Deserialize)]
struct LabelQuery {
    label: Option<String>,
}

impl LabelQuery {
    fn label(&self) -> Option<&str> {
        self.label.as_deref().map(str::trim).filter(|l| !l.is_empty())
    }
}

#[derive(Deserialize)]
struct AuditQuery {
    month: u32,
    year: i32,
}

#[derive(Deserialize, Default)]
struct SyncRequest {
    project_id: Option<i64>,
}

#[derive(Deserialize)]
struct RegisterProjectRequest {
    id: i64,
    name: String,
}

/// Active project with its review counter.
#[derive(Serialize)]
struct ProjectSummary {
    id: i64,
    name: String,
    review_task_count: i64,
}

#[derive(Serialize)]
struct AdmissionResponse {
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<RejectReason>,
}

#[derive(Serialize)]
struct SyncStatusResponse {
    #[serde(flatten)]
    status: SyncStatus,
    recent_logs: Vec<SyncLogEntry>,
}

// ── Route builders ───────────────────────────────────────────────────────────

/// Read routes and sync triggers. No authentication.
pub fn query_routes() -> Router<ApiState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/projects", get(list_active_projects))
        .route("/api/projects/{id}/tasks", get(list_tasks))
        .route("/api/tasks", get(list_all_tasks))
        .route("/api/sync", post(request_sync))
        .route("/api/sync/project/{id}", post(request_project_sync))
        .route("/api/sync/status", get(get_sync_status))
        .route("/api/audit/summaries", get(get_audit_summaries))
        .route("/api/audit/details", get(get_audit_details))
        .route("/api/audit/sync", post(request_audit_sync))
        .route("/api/audit/sync/status", get(get_audit_sync_status))
        .route("/api/monitored_projects", get(list_registry))
        .route("/api/labels/discover", get(discover_labels))
        .route("/api/wiki/projects", get(list_wiki_projects))
        .route("/api/wiki/projects/{id}/pages/tree", get(get_wiki_tree))
        .route("/api/wiki/projects/{id}/pages/{*slug}", get(get_wiki_page))
}

/// Registry mutations. The admin-secret middleware is applied in server.rs.
pub fn admin_routes() -> Router<ApiState> {
    Router::new()
        .route("/api/monitored_projects", post(register_project))
        .route("/api/monitored_projects/{id}/toggle", post(toggle_project))
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// GET /api/health
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/projects?label=: active projects with open tasks carrying the label.
async fn list_active_projects(
    State(state): State<ApiState>,
    Query(query): Query<LabelQuery>,
) -> Result<Json<Vec<ProjectSummary>>, ApiErr> {
    let label = query
        .label()
        .unwrap_or(state.settings.sync.review_label.as_str());

    let projects = project::list_active_projects(&state.db).await?;
    let mut summaries = Vec::with_capacity(projects.len());
    for p in projects {
        let review_task_count = task_store::count_open_with_label(&state.db, p.id, label).await?;
        summaries.push(ProjectSummary {
            id: p.id,
            name: p.name,
            review_task_count,
        });
    }
    Ok(Json(summaries))
}

fn with_metrics(state: &ApiState, tasks: Vec<crate::models::Task>) -> Vec<TaskWithMetrics> {
    let classifier = state.settings.stages.classifier();
    let now = Utc::now();
    tasks
        .into_iter()
        .map(|task| {
            let metrics = compute_cycle_metrics(&task, &classifier, now);
            TaskWithMetrics { task, metrics }
        })
        .collect()
}

/// GET /api/projects/{id}/tasks?label=: one project's tasks with cycle metrics.
///
/// An inactive project yields an empty list.
async fn list_tasks(
    State(state): State<ApiState>,
    Path(project_id): Path<i64>,
    Query(query): Query<LabelQuery>,
) -> Result<Json<Vec<TaskWithMetrics>>, ApiErr> {
    let project = project::get_project(&state.db, project_id)
        .await?
        .ok_or_else(|| AppError::not_found_with_id("Project", project_id.to_string()))?;
    if !project.is_active {
        return Ok(Json(Vec::new()));
    }

    let filter = TaskFilter {
        project_id: Some(project_id),
        label: query.label().map(str::to_string),
        ..Default::default()
    };
    let tasks = task_store::scan_tasks(&state.db, &filter).await?;
    Ok(Json(with_metrics(&state, tasks)))
}

/// GET /api/tasks?label=: tasks of every active project.
async fn list_all_tasks(
    State(state): State<ApiState>,
    Query(query): Query<LabelQuery>,
) -> Result<Json<Vec<TaskWithMetrics>>, ApiErr> {
    let project_ids = project::list_active_projects(&state.db)
        .await?
        .into_iter()
        .map(|p| p.id)
        .collect();

    let filter = TaskFilter {
        project_ids: Some(project_ids),
        label: query.label().map(str::to_string),
        ..Default::default()
    };
    let tasks = task_store::scan_tasks(&state.db, &filter).await?;
    Ok(Json(with_metrics(&state, tasks)))
}

fn admission_response(admission: SyncAdmission) -> Response {
    match admission {
        SyncAdmission::Accepted => (
            StatusCode::ACCEPTED,
            Json(AdmissionResponse {
                accepted: true,
                reason: None,
            }),
        )
            .into_response(),
        SyncAdmission::Rejected(reason) => (
            StatusCode::CONFLICT,
            Json(AdmissionResponse {
                accepted: false,
                reason: Some(reason),
            }),
        )
            .into_response(),
    }
}

/// POST /api/sync: sync every active project, or one with `{"project_id": N}`.
async fn request_sync(
    State(state): State<ApiState>,
    body: Option<Json<SyncRequest>>,
) -> Result<Response, ApiErr> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let scope = match request.project_id {
        Some(id) => SyncScope::Project(id),
        None => SyncScope::AllProjects,
    };
    let admission = state.sync_handle.request_sync(scope).await?;
    Ok(admission_response(admission))
}

/// POST /api/sync/project/{id}
async fn request_project_sync(
    State(state): State<ApiState>,
    Path(project_id): Path<i64>,
) -> Result<Response, ApiErr> {
    let admission = state
        .sync_handle
        .request_sync(SyncScope::Project(project_id))
        .await?;
    Ok(admission_response(admission))
}

async fn status_response(
    state: &ApiState,
    status: SyncStatus,
    operation: &str,
) -> Result<Json<SyncStatusResponse>, ApiErr> {
    let recent_logs = sync_log::get_sync_log(&state.db, STATUS_LOG_ENTRIES)
        .await?
        .into_iter()
        .filter(|entry| entry.operation == operation)
        .collect();
    Ok(Json(SyncStatusResponse {
        status,
        recent_logs,
    }))
}

/// GET /api/sync/status
async fn get_sync_status(
    State(state): State<ApiState>,
) -> Result<Json<SyncStatusResponse>, ApiErr> {
    let status = state.sync_handle.status().await;
    status_response(&state, status, "sync_complete").await
}

/// GET /api/audit/summaries?month=&year=
async fn get_audit_summaries(
    State(state): State<ApiState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditSummary>>, ApiErr> {
    let report = load_and_compute_audit(&state.db, &state.settings, query.month, query.year).await?;
    Ok(Json(report.summaries))
}

/// GET /api/audit/details?month=&year=
async fn get_audit_details(
    State(state): State<ApiState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEvent>>, ApiErr> {
    let report = load_and_compute_audit(&state.db, &state.settings, query.month, query.year).await?;
    Ok(Json(report.details))
}

/// POST /api/audit/sync: fetch wiki and push activity for `{"month", "year"}`.
async fn request_audit_sync(
    State(state): State<ApiState>,
    Json(body): Json<AuditQuery>,
) -> Result<Response, ApiErr> {
    let admission = state
        .sync_handle
        .request_audit_sync(body.month, body.year)
        .await?;
    Ok(admission_response(admission))
}

/// GET /api/audit/sync/status
async fn get_audit_sync_status(
    State(state): State<ApiState>,
) -> Result<Json<SyncStatusResponse>, ApiErr> {
    let status = state.sync_handle.audit_status().await;
    status_response(&state, status, "audit_sync_complete").await
}

/// GET /api/monitored_projects: the full registry, inactive projects included.
async fn list_registry(
    State(state): State<ApiState>,
) -> Result<Json<Vec<MonitoredProject>>, ApiErr> {
    Ok(Json(project::list_projects(&state.db).await?))
}

/// POST /api/monitored_projects: register a project (admin).
async fn register_project(
    State(state): State<ApiState>,
    Json(body): Json<RegisterProjectRequest>,
) -> Result<(StatusCode, Json<MonitoredProject>), ApiErr> {
    let project = project::register_project(&state.db, body.id, &body.name).await?;
    log::info!("[api] Registered project {} ({})", project.id, project.name);
    Ok((StatusCode::CREATED, Json(project)))
}

/// POST /api/monitored_projects/{id}/toggle: flip the active flag (admin).
async fn toggle_project(
    State(state): State<ApiState>,
    Path(project_id): Path<i64>,
) -> Result<Json<ProjectToggle>, ApiErr> {
    let toggle = project::toggle_project(&state.db, project_id).await?;
    log::info!(
        "[api] Project {} is now {}",
        toggle.id,
        if toggle.is_active { "active" } else { "inactive" }
    );
    Ok(Json(toggle))
}

/// GET /api/labels/discover: stage labels found on the active projects.
async fn discover_labels(
    State(state): State<ApiState>,
) -> Result<Json<StageLabelReport>, ApiErr> {
    let report = discover_stage_labels(
        &state.db,
        state.remote.as_ref(),
        &state.settings.stages.classifier(),
        &RetryPolicy::from(&state.settings.sync),
    )
    .await?;
    Ok(Json(report))
}

/// GET /api/wiki/projects: active projects with a wiki.
async fn list_wiki_projects(
    State(state): State<ApiState>,
) -> Result<Json<Vec<WikiProject>>, ApiErr> {
    let projects = wiki_portal::list_wiki_projects(
        &state.db,
        state.remote.as_ref(),
        &RetryPolicy::from(&state.settings.sync),
        state.settings.sync.max_concurrent_projects,
    )
    .await?;
    Ok(Json(projects))
}

/// GET /api/wiki/projects/{id}/pages/tree
async fn get_wiki_tree(
    State(state): State<ApiState>,
    Path(project_id): Path<i64>,
) -> Result<Json<Vec<WikiNode>>, ApiErr> {
    let tree = wiki_portal::page_tree(
        &state.db,
        state.remote.as_ref(),
        &RetryPolicy::from(&state.settings.sync),
        project_id,
    )
    .await?;
    Ok(Json(tree))
}

/// GET /api/wiki/projects/{id}/pages/{slug}: the slug may span several segments.
async fn get_wiki_page(
    State(state): State<ApiState>,
    Path((project_id, slug)): Path<(i64, String)>,
) -> Result<Json<WikiPageContent>, ApiErr> {
    let page = wiki_portal::page_content(
        &state.db,
        state.remote.as_ref(),
        &RetryPolicy::from(&state.settings.sync),
        project_id,
        &slug,
    )
    .await?;
    Ok(Json(page))
}
