//! Task snapshot store.
//!
//! Each sync replaces a task's row wholesale. `first_seen_at` survives the
//! replacement; `last_synced_at` is refreshed.

use super::{from_json, from_millis, to_millis, DbError};
use crate::error::AppError;
use crate::models::task::labels_contain;
use crate::models::{Task, TaskRecord, TimeStats};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

/// Filters for [`scan_tasks`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub project_id: Option<i64>,
    pub project_ids: Option<Vec<i64>>,
    /// Case-insensitive match against the current label set.
    pub label: Option<String>,
    /// `opened` or `closed`.
    pub state: Option<String>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_since: Option<DateTime<Utc>>,
}

#[derive(FromRow)]
struct TaskRow {
    task_id: i64,
    project_id: i64,
    iid: i64,
    title: String,
    description: Option<String>,
    state: String,
    web_url: String,
    author_username: String,
    assignee_username: Option<String>,
    milestone: Option<String>,
    labels: String,
    time_estimate: Option<i64>,
    total_time_spent: Option<i64>,
    created_at: i64,
    updated_at: i64,
    closed_at: Option<i64>,
    label_history: String,
    first_seen_at: i64,
    last_synced_at: i64,
}

impl TryFrom<TaskRow> for Task {
    type Error = DbError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let time_stats = match (row.time_estimate, row.total_time_spent) {
            (None, None) => None,
            (estimate, spent) => Some(TimeStats {
                time_estimate: estimate.unwrap_or(0),
                total_time_spent: spent.unwrap_or(0),
            }),
        };

        Ok(Task {
            task_id: row.task_id,
            project_id: row.project_id,
            iid: row.iid,
            title: row.title,
            description: row.description,
            state: row.state,
            web_url: row.web_url,
            author: row.author_username,
            assignee: row.assignee_username,
            milestone: row.milestone,
            labels: from_json("labels", &row.labels)?,
            time_stats,
            created_at: from_millis("created_at", row.created_at)?,
            updated_at: from_millis("updated_at", row.updated_at)?,
            closed_at: row
                .closed_at
                .map(|ms| from_millis("closed_at", ms))
                .transpose()?,
            label_history: from_json("label_history", &row.label_history)?,
            first_seen_at: Some(from_millis("first_seen_at", row.first_seen_at)?),
            last_synced_at: Some(from_millis("last_synced_at", row.last_synced_at)?),
        })
    }
}

const SELECT_TASK: &str = "SELECT task_id, project_id, iid, title, description, state, web_url, \
     author_username, assignee_username, milestone, labels, time_estimate, total_time_spent, \
     created_at, updated_at, closed_at, label_history, first_seen_at, last_synced_at FROM tasks";

/// Insert or replace a task snapshot.
pub async fn upsert_task(
    pool: &SqlitePool,
    record: &TaskRecord,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let task = &record.task;
    let labels = serde_json::to_string(&task.labels)?;
    let history = serde_json::to_string(&task.label_history)?;
    let raw = serde_json::to_string(&record.raw_data)?;
    let now = to_millis(now);

    sqlx::query(
        r#"
        INSERT INTO tasks (
            task_id, project_id, iid, title, description, state, web_url,
            author_username, assignee_username, milestone, labels,
            time_estimate, total_time_spent, created_at, updated_at, closed_at,
            label_history, raw_data, first_seen_at, last_synced_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(task_id) DO UPDATE SET
            project_id = excluded.project_id,
            iid = excluded.iid,
            title = excluded.title,
            description = excluded.description,
            state = excluded.state,
            web_url = excluded.web_url,
            author_username = excluded.author_username,
            assignee_username = excluded.assignee_username,
            milestone = excluded.milestone,
            labels = excluded.labels,
            time_estimate = excluded.time_estimate,
            total_time_spent = excluded.total_time_spent,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            closed_at = excluded.closed_at,
            label_history = excluded.label_history,
            raw_data = excluded.raw_data,
            last_synced_at = excluded.last_synced_at
        "#,
    )
    .bind(task.task_id)
    .bind(task.project_id)
    .bind(task.iid)
    .bind(&task.title)
    .bind(&task.description)
    .bind(&task.state)
    .bind(&task.web_url)
    .bind(&task.author)
    .bind(&task.assignee)
    .bind(&task.milestone)
    .bind(labels)
    .bind(task.time_stats.map(|t| t.time_estimate))
    .bind(task.time_stats.map(|t| t.total_time_spent))
    .bind(to_millis(task.created_at))
    .bind(to_millis(task.updated_at))
    .bind(task.closed_at.map(to_millis))
    .bind(history)
    .bind(raw)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .map_err(|e| AppError::database_with_op(e.to_string(), "upsert_task"))?;

    Ok(())
}

/// Point lookup by task ID.
pub async fn get_task(pool: &SqlitePool, task_id: i64) -> Result<Option<Task>, AppError> {
    let row = sqlx::query_as::<_, TaskRow>(&format!("{} WHERE task_id = ?", SELECT_TASK))
        .bind(task_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(Task::try_from).transpose()?)
}

/// The stored `updated_at` of a task, used to skip unchanged label histories.
pub async fn get_task_version(
    pool: &SqlitePool,
    task_id: i64,
) -> Result<Option<DateTime<Utc>>, AppError> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT updated_at FROM tasks WHERE task_id = ?")
        .bind(task_id)
        .fetch_optional(pool)
        .await?;

    Ok(row
        .map(|(ms,)| from_millis("updated_at", ms))
        .transpose()?)
}

/// Filtered scan, newest update first.
pub async fn scan_tasks(pool: &SqlitePool, filter: &TaskFilter) -> Result<Vec<Task>, AppError> {
    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(SELECT_TASK);
    query.push(" WHERE 1 = 1");

    if let Some(project_id) = filter.project_id {
        query.push(" AND project_id = ").push_bind(project_id);
    }
    if let Some(ids) = &filter.project_ids {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        query.push(" AND project_id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
    }
    if let Some(state) = &filter.state {
        query.push(" AND state = ").push_bind(state.clone());
    }
    if let Some(before) = filter.created_before {
        query.push(" AND created_at < ").push_bind(to_millis(before));
    }
    if let Some(since) = filter.updated_since {
        query.push(" AND updated_at >= ").push_bind(to_millis(since));
    }
    query.push(" ORDER BY updated_at DESC, task_id");

    let rows: Vec<TaskRow> = query.build_query_as().fetch_all(pool).await?;

    let mut tasks = Vec::with_capacity(rows.len());
    for row in rows {
        let task = Task::try_from(row)?;
        // Labels live in a JSON column; SQLite LOWER() only folds ASCII.
        if let Some(label) = &filter.label {
            if !task.has_label(label) {
                continue;
            }
        }
        tasks.push(task);
    }

    Ok(tasks)
}

/// Number of open tasks in a project carrying `label`.
///
/// Reads only the label column.
pub async fn count_open_with_label(
    pool: &SqlitePool,
    project_id: i64,
    label: &str,
) -> Result<i64, AppError> {
    let rows: Vec<String> =
        sqlx::query_scalar("SELECT labels FROM tasks WHERE project_id = ? AND state = 'opened'")
            .bind(project_id)
            .fetch_all(pool)
            .await?;

    let mut count = 0;
    for raw in rows {
        let labels: Vec<String> = from_json("labels", &raw)?;
        if labels_contain(&labels, label) {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::{LabelAction, LabelChange};
    use chrono::{Duration, TimeZone};
    use tempfile::{tempdir, TempDir};

    async fn setup_test_db() -> (TempDir, SqlitePool) {
        let dir = tempdir().unwrap();
        let pool = db::initialize(&dir.path().join("test.db")).await.unwrap();
        (dir, pool)
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    fn record(task_id: i64, project_id: i64, labels: &[&str], state: &str) -> TaskRecord {
        TaskRecord {
            task: Task {
                task_id,
                project_id,
                iid: task_id % 100,
                title: format!("Issue {}", task_id),
                description: Some("Steps to reproduce".into()),
                state: state.into(),
                web_url: format!("https://gitlab.example.com/issues/{}", task_id),
                author: "ana".into(),
                assignee: Some("luis".into()),
                milestone: None,
                labels: labels.iter().map(|l| l.to_string()).collect(),
                time_stats: Some(TimeStats {
                    time_estimate: 3600,
                    total_time_spent: 0,
                }),
                created_at: at(1, 9),
                updated_at: at(2, 9),
                closed_at: None,
                label_history: vec![LabelChange {
                    label: labels.first().map(|l| l.to_string()).unwrap_or_default(),
                    action: LabelAction::Add,
                    at: at(1, 10),
                    actor: Some("ana".into()),
                }],
                first_seen_at: None,
                last_synced_at: None,
            },
            raw_data: serde_json::json!({ "id": task_id }),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_get_task() {
        let (_dir, pool) = setup_test_db().await;
        let rec = record(1001, 7, &["PARA REVISIÓN"], "opened");

        upsert_task(&pool, &rec, at(3, 0)).await.unwrap();

        let task = get_task(&pool, 1001).await.unwrap().unwrap();
        assert_eq!(task.title, "Issue 1001");
        assert_eq!(task.labels, vec!["PARA REVISIÓN"]);
        assert_eq!(task.label_history, rec.task.label_history);
        assert_eq!(task.time_stats.unwrap().time_estimate, 3600);
        assert_eq!(task.first_seen_at, Some(at(3, 0)));
        assert!(get_task(&pool, 9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_but_keeps_first_seen() {
        let (_dir, pool) = setup_test_db().await;
        let mut rec = record(1001, 7, &["EN EJECUCIÓN"], "opened");
        upsert_task(&pool, &rec, at(3, 0)).await.unwrap();

        rec.task.title = "Renamed".into();
        rec.task.labels = vec![];
        rec.task.updated_at = at(4, 0);
        upsert_task(&pool, &rec, at(5, 0)).await.unwrap();

        let task = get_task(&pool, 1001).await.unwrap().unwrap();
        assert_eq!(task.title, "Renamed");
        assert!(task.labels.is_empty());
        assert_eq!(task.first_seen_at, Some(at(3, 0)));
        assert_eq!(task.last_synced_at, Some(at(5, 0)));
        assert_eq!(get_task_version(&pool, 1001).await.unwrap(), Some(at(4, 0)));
    }

    #[tokio::test]
    async fn test_scan_filters() {
        let (_dir, pool) = setup_test_db().await;
        upsert_task(&pool, &record(1, 7, &["Para Revisión"], "opened"), at(3, 0))
            .await
            .unwrap();
        upsert_task(&pool, &record(2, 7, &["PARA REVISIÓN"], "closed"), at(3, 0))
            .await
            .unwrap();
        upsert_task(&pool, &record(3, 8, &["PARA REVISIÓN"], "opened"), at(3, 0))
            .await
            .unwrap();

        let by_project = scan_tasks(
            &pool,
            &TaskFilter {
                project_id: Some(7),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(by_project.len(), 2);

        let by_label = scan_tasks(
            &pool,
            &TaskFilter {
                label: Some("para revisión".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(by_label.len(), 3);

        let in_set = scan_tasks(
            &pool,
            &TaskFilter {
                project_ids: Some(vec![8]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(in_set.len(), 1);

        let none = scan_tasks(
            &pool,
            &TaskFilter {
                project_ids: Some(vec![]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(none.is_empty());

        let recent = scan_tasks(
            &pool,
            &TaskFilter {
                updated_since: Some(at(2, 9) + Duration::seconds(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(recent.is_empty());

        assert_eq!(count_open_with_label(&pool, 7, "PARA REVISIÓN").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_count_open_with_label() {
        let (_dir, pool) = setup_test_db().await;
        for rec in [
            record(1, 7, &["PARA REVISIÓN"], "opened"),
            record(2, 7, &["bug", "para revisión"], "opened"),
            record(3, 7, &["PARA REVISIÓN"], "closed"),
            record(4, 7, &["bug"], "opened"),
            record(5, 8, &["PARA REVISIÓN"], "opened"),
        ] {
            upsert_task(&pool, &rec, at(3, 0)).await.unwrap();
        }

        assert_eq!(count_open_with_label(&pool, 7, "Para Revisión").await.unwrap(), 2);
        assert_eq!(count_open_with_label(&pool, 7, "bug").await.unwrap(), 2);
        assert_eq!(count_open_with_label(&pool, 9, "bug").await.unwrap(), 0);
    }
}
