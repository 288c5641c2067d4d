//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use gitlab_task_monitor::config::SyncConfig;
use gitlab_task_monitor::db::{self, pool::DbPool};
use gitlab_task_monitor::error::AppError;
use gitlab_task_monitor::services::gitlab_client::{
    GitLabLabel, GitLabLabelEvent, GitLabWikiPage, Page, RemoteSource,
};
use gitlab_task_monitor::services::sync_engine::SyncHandle;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

/// In-memory GitLab.
#[derive(Default)]
pub struct FakeRemote {
    /// Issue pages per project.
    pub issue_pages: HashMap<i64, Vec<Vec<Value>>>,
    /// Label events per `(project_id, iid)`.
    pub label_events: HashMap<(i64, i64), Value>,
    /// Activity feed per project (single page).
    pub events: HashMap<i64, Vec<Value>>,
    /// Label names per project.
    pub labels: HashMap<i64, Vec<String>>,
    /// Wiki pages per project as `(slug, title, content)`.
    pub wiki_pages: HashMap<i64, Vec<(String, String, String)>>,
    /// Projects whose wiki answers 403.
    pub wiki_forbidden: HashSet<i64>,
    /// Projects whose every request answers 503.
    pub unavailable: HashSet<i64>,
    /// Issues whose label events answer 404.
    pub missing_label_events: HashSet<(i64, i64)>,
    /// When set, issue requests wait for a permit.
    pub gate: Option<Semaphore>,

    pub issue_requests: Mutex<Vec<i64>>,
    pub label_event_requests: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn open_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1_000);
        }
    }

    pub fn fetched_projects(&self) -> Vec<i64> {
        let mut ids = self.issue_requests.lock().unwrap().clone();
        ids.sort();
        ids.dedup();
        ids
    }

    fn unavailable_error(project_id: i64) -> AppError {
        AppError::gitlab_api_full(
            "Service unavailable",
            503,
            format!("/projects/{}", project_id),
        )
    }
}

#[async_trait]
impl RemoteSource for FakeRemote {
    async fn list_issues_page(&self, project_id: i64, page: u32) -> Result<Page<Value>, AppError> {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        self.issue_requests.lock().unwrap().push(project_id);
        if self.unavailable.contains(&project_id) {
            return Err(Self::unavailable_error(project_id));
        }

        let pages = self.issue_pages.get(&project_id).cloned().unwrap_or_default();
        let idx = page.saturating_sub(1) as usize;
        let items = pages.get(idx).cloned().unwrap_or_default();
        let next_page = (idx + 1 < pages.len()).then_some(page + 1);
        Ok(Page { items, next_page })
    }

    async fn list_label_events(
        &self,
        project_id: i64,
        issue_iid: i64,
    ) -> Result<Vec<GitLabLabelEvent>, AppError> {
        self.label_event_requests.fetch_add(1, Ordering::SeqCst);
        if self.missing_label_events.contains(&(project_id, issue_iid)) {
            return Err(AppError::gitlab_api_full(
                "Resource not found",
                404,
                format!("/projects/{}/issues/{}/resource_label_events", project_id, issue_iid),
            ));
        }
        let raw = self
            .label_events
            .get(&(project_id, issue_iid))
            .cloned()
            .unwrap_or_else(|| json!([]));
        Ok(serde_json::from_value(raw)?)
    }

    async fn list_events_page(
        &self,
        project_id: i64,
        _after: NaiveDate,
        _before: NaiveDate,
        _page: u32,
    ) -> Result<Page<Value>, AppError> {
        if self.unavailable.contains(&project_id) {
            return Err(Self::unavailable_error(project_id));
        }
        Ok(Page {
            items: self.events.get(&project_id).cloned().unwrap_or_default(),
            next_page: None,
        })
    }

    async fn list_labels(&self, project_id: i64) -> Result<Vec<GitLabLabel>, AppError> {
        Ok(self
            .labels
            .get(&project_id)
            .map(|names| {
                names
                    .iter()
                    .enumerate()
                    .map(|(i, name)| GitLabLabel {
                        id: i as i64,
                        name: name.clone(),
                        color: None,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_wiki_pages(&self, project_id: i64) -> Result<Vec<GitLabWikiPage>, AppError> {
        if self.wiki_forbidden.contains(&project_id) {
            return Err(AppError::gitlab_api_full(
                "Access denied",
                403,
                format!("/projects/{}/wikis", project_id),
            ));
        }
        Ok(self
            .wiki_pages
            .get(&project_id)
            .map(|pages| {
                pages
                    .iter()
                    .map(|(slug, title, _)| GitLabWikiPage {
                        slug: slug.clone(),
                        title: title.clone(),
                        format: Some("markdown".into()),
                        content: None,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_wiki_page(&self, project_id: i64, slug: &str) -> Result<GitLabWikiPage, AppError> {
        self.wiki_pages
            .get(&project_id)
            .and_then(|pages| pages.iter().find(|(s, _, _)| s == slug))
            .map(|(slug, title, content)| GitLabWikiPage {
                slug: slug.clone(),
                title: title.clone(),
                format: Some("markdown".into()),
                content: Some(content.clone()),
            })
            .ok_or_else(|| {
                AppError::gitlab_api_full(
                    "Resource not found",
                    404,
                    format!("/projects/{}/wikis/{}", project_id, slug),
                )
            })
    }
}

/// Wiki page fixture.
pub fn wiki_page(slug: &str, title: &str, content: &str) -> (String, String, String) {
    (slug.to_string(), title.to_string(), content.to_string())
}

/// GitLab issue payload.
pub fn issue(id: i64, iid: i64, project_id: i64, updated_at: &str, labels: &[&str]) -> Value {
    json!({
        "id": id,
        "iid": iid,
        "project_id": project_id,
        "title": format!("Issue {}", iid),
        "description": null,
        "state": "opened",
        "web_url": format!("https://gitlab.example.com/p/{}/-/issues/{}", project_id, iid),
        "author": { "id": 1, "username": "ana", "name": "Ana" },
        "assignees": [{ "id": 2, "username": "luis", "name": "Luis" }],
        "assignee": null,
        "milestone": null,
        "labels": labels,
        "time_stats": { "time_estimate": 0, "total_time_spent": 0 },
        "created_at": "2024-03-01T09:00:00Z",
        "updated_at": updated_at,
        "closed_at": null
    })
}

/// `resource_label_events` entry.
pub fn label_event(id: i64, label: &str, action: &str, at: &str, user: &str) -> Value {
    json!({
        "id": id,
        "user": { "id": 9, "username": user },
        "created_at": at,
        "label": { "id": id, "name": label },
        "action": action
    })
}

/// Fast retries so failure tests finish quickly.
pub fn test_sync_config() -> SyncConfig {
    SyncConfig {
        interval_secs: 0,
        max_retries: 1,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        max_concurrent_projects: 2,
        ..SyncConfig::default()
    }
}

pub async fn setup_db() -> (TempDir, DbPool) {
    let dir = tempfile::tempdir().unwrap();
    let pool = db::initialize(&dir.path().join("test.db")).await.unwrap();
    (dir, pool)
}

/// Poll until no run is in flight.
pub async fn wait_idle(handle: &SyncHandle) {
    for _ in 0..500 {
        if !handle.is_busy().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("sync did not finish in time");
}

pub fn ts(raw: &str) -> DateTime<Utc> {
    raw.parse().unwrap()
}
