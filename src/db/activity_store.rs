//! Activity event store (wiki edits and pushes).

use super::{from_millis, to_millis, DbError};
use crate::error::AppError;
use crate::models::{ActivityEvent, ActivityKind};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

#[derive(FromRow)]
struct ActivityRow {
    project_id: i64,
    event_id: i64,
    kind: String,
    action_name: String,
    username: String,
    target_title: Option<String>,
    wiki_slug: Option<String>,
    ref_name: Option<String>,
    commit_count: Option<i64>,
    created_at: i64,
}

impl TryFrom<ActivityRow> for ActivityEvent {
    type Error = DbError;

    fn try_from(row: ActivityRow) -> Result<Self, Self::Error> {
        let kind = row
            .kind
            .parse::<ActivityKind>()
            .map_err(|message| DbError::Corrupt {
                column: "kind",
                message,
            })?;
        Ok(ActivityEvent {
            project_id: row.project_id,
            event_id: row.event_id,
            kind,
            action_name: row.action_name,
            username: row.username,
            target_title: row.target_title,
            wiki_slug: row.wiki_slug,
            ref_name: row.ref_name,
            commit_count: row.commit_count,
            created_at: from_millis("created_at", row.created_at)?,
        })
    }
}

/// Insert or replace an activity event keyed by `(project_id, event_id)`.
///
/// Audit windows overlap by a day on each side, so the same event is routinely
/// written twice.
pub async fn upsert_activity(pool: &SqlitePool, event: &ActivityEvent) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO activity_events (
            project_id, event_id, kind, action_name, username,
            target_title, wiki_slug, ref_name, commit_count, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(project_id, event_id) DO UPDATE SET
            kind = excluded.kind,
            action_name = excluded.action_name,
            username = excluded.username,
            target_title = excluded.target_title,
            wiki_slug = excluded.wiki_slug,
            ref_name = excluded.ref_name,
            commit_count = excluded.commit_count,
            created_at = excluded.created_at
        "#,
    )
    .bind(event.project_id)
    .bind(event.event_id)
    .bind(event.kind.as_str())
    .bind(&event.action_name)
    .bind(&event.username)
    .bind(&event.target_title)
    .bind(&event.wiki_slug)
    .bind(&event.ref_name)
    .bind(event.commit_count)
    .bind(to_millis(event.created_at))
    .execute(pool)
    .await
    .map_err(|e| AppError::database_with_op(e.to_string(), "upsert_activity"))?;

    Ok(())
}

/// Events of the given projects with `from <= created_at < to`, oldest first.
pub async fn scan_activity(
    pool: &SqlitePool,
    project_ids: &[i64],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<ActivityEvent>, AppError> {
    if project_ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT project_id, event_id, kind, action_name, username, target_title, wiki_slug, \
         ref_name, commit_count, created_at FROM activity_events WHERE created_at >= ",
    );
    query.push_bind(to_millis(from));
    query.push(" AND created_at < ").push_bind(to_millis(to));
    query.push(" AND project_id IN (");
    let mut separated = query.separated(", ");
    for id in project_ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
    query.push(" ORDER BY created_at, event_id");

    let rows: Vec<ActivityRow> = query.build_query_as().fetch_all(pool).await?;
    rows.into_iter()
        .map(|row| ActivityEvent::try_from(row).map_err(AppError::from))
        .collect()
}
