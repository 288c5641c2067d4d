//! Monitored-project registry.
//!
//! Only active projects are synced or included in audits. The flag is flipped
//! through [`toggle_project`]; everything else reads it.

use crate::config::SeedProject;
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A project eligible for sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct MonitoredProject {
    /// GitLab project ID.
    pub id: i64,

    /// Display name.
    pub name: String,

    /// Inactive projects are never fetched and never aggregated.
    pub is_active: bool,

    /// When the project was registered (Unix seconds).
    pub created_at: i64,
}

/// Result of a toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProjectToggle {
    pub id: i64,
    pub is_active: bool,
}

const SELECT_PROJECT: &str = "SELECT id, name, is_active, created_at FROM monitored_projects";

/// All registered projects, active or not.
pub async fn list_projects(pool: &sqlx::SqlitePool) -> Result<Vec<MonitoredProject>, AppError> {
    let projects = sqlx::query_as::<_, MonitoredProject>(&format!("{} ORDER BY id", SELECT_PROJECT))
        .fetch_all(pool)
        .await?;
    Ok(projects)
}

/// Projects currently eligible for sync and audit.
pub async fn list_active_projects(
    pool: &sqlx::SqlitePool,
) -> Result<Vec<MonitoredProject>, AppError> {
    let projects = sqlx::query_as::<_, MonitoredProject>(&format!(
        "{} WHERE is_active = 1 ORDER BY id",
        SELECT_PROJECT
    ))
    .fetch_all(pool)
    .await?;
    Ok(projects)
}

/// Look up a project by ID.
pub async fn get_project(
    pool: &sqlx::SqlitePool,
    project_id: i64,
) -> Result<Option<MonitoredProject>, AppError> {
    let project =
        sqlx::query_as::<_, MonitoredProject>(&format!("{} WHERE id = ?", SELECT_PROJECT))
            .bind(project_id)
            .fetch_optional(pool)
            .await?;
    Ok(project)
}

/// Register a new, active project.
///
/// Fails with `Conflict` when the ID is already registered.
pub async fn register_project(
    pool: &sqlx::SqlitePool,
    project_id: i64,
    name: &str,
) -> Result<MonitoredProject, AppError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::invalid_input_field("Project name is required", "name"));
    }

    let result = sqlx::query(
        "INSERT INTO monitored_projects (id, name, is_active) VALUES (?, ?, 1)
         ON CONFLICT(id) DO NOTHING",
    )
    .bind(project_id)
    .bind(name)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::conflict(format!(
            "Project {} is already registered",
            project_id
        )));
    }

    get_project(pool, project_id)
        .await?
        .ok_or_else(|| AppError::internal("Registered project vanished"))
}

/// Insert seed projects that are not registered yet; existing rows keep their flag.
///
/// Returns how many projects were added.
pub async fn seed_projects(
    pool: &sqlx::SqlitePool,
    seeds: &[SeedProject],
) -> Result<u64, AppError> {
    let mut added = 0;
    for seed in seeds {
        let result = sqlx::query(
            "INSERT INTO monitored_projects (id, name, is_active) VALUES (?, ?, 1)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(seed.id)
        .bind(&seed.name)
        .execute(pool)
        .await?;
        added += result.rows_affected();
    }
    Ok(added)
}

/// Flip a project's active flag.
pub async fn toggle_project(
    pool: &sqlx::SqlitePool,
    project_id: i64,
) -> Result<ProjectToggle, AppError> {
    let row: Option<(bool,)> = sqlx::query_as(
        "UPDATE monitored_projects SET is_active = 1 - is_active WHERE id = ? RETURNING is_active",
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some((is_active,)) => Ok(ProjectToggle {
            id: project_id,
            is_active,
        }),
        None => Err(AppError::not_found_with_id(
            "Project",
            project_id.to_string(),
        )),
    }
}
