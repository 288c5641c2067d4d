//! Log of recent sync runs, trimmed to the newest [`MAX_LOG_ENTRIES`].

use crate::error::AppError;
use serde::Serialize;
use sqlx::{FromRow, SqlitePool};

/// Maximum number of log entries to keep.
pub const MAX_LOG_ENTRIES: i64 = 50;

/// Outcome recorded for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    /// Some projects failed.
    Partial,
    Error,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Error => "error",
        }
    }
}

/// Sync log entry matching the `sync_log` table.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SyncLogEntry {
    pub id: i64,
    pub operation: String,
    pub status: String,
    pub project_id: Option<i64>,
    pub message: Option<String>,
    pub duration_ms: Option<i64>,
    pub timestamp: i64,
}

/// Append an entry and drop the oldest beyond the cap.
pub async fn log_sync_operation(
    pool: &SqlitePool,
    operation: &str,
    status: LogStatus,
    project_id: Option<i64>,
    message: Option<&str>,
    duration_ms: Option<i64>,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO sync_log (operation, status, project_id, message, duration_ms, timestamp)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(operation)
    .bind(status.as_str())
    .bind(project_id)
    .bind(message)
    .bind(duration_ms)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        DELETE FROM sync_log WHERE id NOT IN (
            SELECT id FROM sync_log ORDER BY id DESC LIMIT ?
        )
        "#,
    )
    .bind(MAX_LOG_ENTRIES)
    .execute(pool)
    .await?;

    Ok(())
}

/// Most recent entries first.
pub async fn get_sync_log(pool: &SqlitePool, limit: i64) -> Result<Vec<SyncLogEntry>, AppError> {
    let entries = sqlx::query_as::<_, SyncLogEntry>(
        "SELECT id, operation, status, project_id, message, duration_ms, timestamp
         FROM sync_log ORDER BY id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}
