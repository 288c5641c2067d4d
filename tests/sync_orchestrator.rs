//! Sync engine behaviour against an in-memory GitLab.
//!
//! Covers single-flight admission, registry scoping, partial failures,
//! skipped payloads, label-history reuse and activity sync.

mod common;

use common::*;
use gitlab_task_monitor::config::Settings;
use gitlab_task_monitor::db::{activity_store, sync_log, task_store};
use gitlab_task_monitor::models::project;
use gitlab_task_monitor::models::{ActivityKind, AuditEventType};
use gitlab_task_monitor::services::audit::load_and_compute_audit;
use gitlab_task_monitor::services::sync_engine::{
    RejectReason, SyncAdmission, SyncEngine, SyncScope,
};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[tokio::test]
async fn test_concurrent_requests_admit_exactly_one() {
    let (_dir, pool) = setup_db().await;
    project::register_project(&pool, 101, "Portal").await.unwrap();

    let mut remote = FakeRemote::gated();
    remote.issue_pages.insert(
        101,
        vec![vec![issue(5501, 55, 101, "2024-03-05T10:00:00Z", &[])]],
    );
    let remote = Arc::new(remote);
    let handle = SyncEngine::start_background(pool.clone(), remote.clone(), test_sync_config(), false);

    let (a, b) = tokio::join!(
        handle.request_sync(SyncScope::AllProjects),
        handle.request_sync(SyncScope::AllProjects)
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(outcomes.iter().filter(|o| o.is_accepted()).count(), 1);
    assert!(outcomes
        .contains(&SyncAdmission::Rejected(RejectReason::AlreadySyncing)));

    // A rejected request leaves the in-flight state untouched.
    let before = handle.status().await;
    assert!(before.is_syncing);
    assert_eq!(before.scope, Some(SyncScope::AllProjects));
    let rejected = handle.request_sync(SyncScope::Project(101)).await.unwrap();
    assert_eq!(rejected, SyncAdmission::Rejected(RejectReason::AlreadySyncing));
    let audit = handle.request_audit_sync(3, 2024).await.unwrap();
    assert!(!audit.is_accepted());
    let after = handle.status().await;
    assert_eq!(after.scope, before.scope);
    assert_eq!(after.started_at, before.started_at);

    remote.open_gate();
    wait_idle(&handle).await;

    let status = handle.status().await;
    assert!(!status.is_syncing);
    assert!(status.last_sync_time.is_some());
    assert!(status.last_error.is_none());
    assert_eq!(status.last_run_task_count, 1);
    assert!(task_store::get_task(&pool, 5501).await.unwrap().is_some());

    // Idle again: the next request is accepted.
    assert!(handle
        .request_sync(SyncScope::AllProjects)
        .await
        .unwrap()
        .is_accepted());
    wait_idle(&handle).await;
}

#[tokio::test]
async fn test_inactive_project_is_never_fetched() {
    let (_dir, pool) = setup_db().await;
    project::register_project(&pool, 101, "Portal").await.unwrap();
    project::register_project(&pool, 102, "Pagos").await.unwrap();
    project::toggle_project(&pool, 101).await.unwrap();

    let mut remote = FakeRemote::new();
    remote.issue_pages.insert(
        101,
        vec![vec![issue(1, 1, 101, "2024-03-05T10:00:00Z", &[])]],
    );
    remote.issue_pages.insert(
        102,
        vec![vec![issue(2, 1, 102, "2024-03-05T10:00:00Z", &[])]],
    );
    let remote = Arc::new(remote);
    let handle = SyncEngine::start_background(pool.clone(), remote.clone(), test_sync_config(), false);

    handle.request_sync(SyncScope::AllProjects).await.unwrap();
    wait_idle(&handle).await;
    assert_eq!(remote.fetched_projects(), vec![102]);

    // Asking for the inactive project explicitly is an empty run, not an error.
    assert!(handle
        .request_sync(SyncScope::Project(101))
        .await
        .unwrap()
        .is_accepted());
    wait_idle(&handle).await;
    let status = handle.status().await;
    assert_eq!(status.last_run_projects, 0);
    assert!(status.last_error.is_none());
    assert_eq!(remote.fetched_projects(), vec![102]);
    assert!(task_store::get_task(&pool, 1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failing_project_does_not_abort_the_run() {
    let (_dir, pool) = setup_db().await;
    project::register_project(&pool, 101, "Portal").await.unwrap();
    project::register_project(&pool, 102, "Pagos").await.unwrap();

    let mut remote = FakeRemote::new();
    remote.issue_pages.insert(
        101,
        vec![vec![issue(1, 1, 101, "2024-03-05T10:00:00Z", &[])]],
    );
    remote.unavailable.insert(102);
    let remote = Arc::new(remote);
    let handle = SyncEngine::start_background(pool.clone(), remote.clone(), test_sync_config(), false);

    handle.request_sync(SyncScope::AllProjects).await.unwrap();
    wait_idle(&handle).await;

    let status = handle.status().await;
    assert!(!status.is_syncing);
    assert!(status.last_sync_time.is_some());
    assert_eq!(status.last_run_projects, 2);
    assert_eq!(status.last_run_failed_projects, 1);
    let error = status.last_error.unwrap();
    assert!(error.contains("Pagos (102)"), "{}", error);
    assert!(task_store::get_task(&pool, 1).await.unwrap().is_some());

    // One retry after the first attempt.
    let attempts = remote
        .issue_requests
        .lock()
        .unwrap()
        .iter()
        .filter(|id| **id == 102)
        .count();
    assert_eq!(attempts, 2);

    let log = sync_log::get_sync_log(&pool, 1).await.unwrap();
    assert_eq!(log[0].operation, "sync_complete");
    assert_eq!(log[0].status, "partial");
}

#[tokio::test]
async fn test_run_where_every_project_fails_still_completes() {
    let (_dir, pool) = setup_db().await;
    project::register_project(&pool, 102, "Pagos").await.unwrap();

    let mut remote = FakeRemote::new();
    remote.unavailable.insert(102);
    let handle = SyncEngine::start_background(pool.clone(), Arc::new(remote), test_sync_config(), false);

    handle.request_sync(SyncScope::AllProjects).await.unwrap();
    wait_idle(&handle).await;

    let status = handle.status().await;
    assert!(!status.is_syncing);
    assert!(status.last_sync_time.is_some());
    assert!(status.last_error.is_some());

    let log = sync_log::get_sync_log(&pool, 1).await.unwrap();
    assert_eq!(log[0].status, "error");
    assert!(handle
        .request_sync(SyncScope::AllProjects)
        .await
        .unwrap()
        .is_accepted());
    wait_idle(&handle).await;
}

#[tokio::test]
async fn test_malformed_issue_is_skipped_and_pages_are_followed() {
    let (_dir, pool) = setup_db().await;
    project::register_project(&pool, 101, "Portal").await.unwrap();

    let mut remote = FakeRemote::new();
    remote.issue_pages.insert(
        101,
        vec![
            vec![
                issue(1, 1, 101, "2024-03-05T10:00:00Z", &[]),
                json!({ "id": "not-a-number", "title": 42 }),
            ],
            vec![issue(2, 2, 101, "2024-03-06T10:00:00Z", &["bug"])],
        ],
    );
    let handle = SyncEngine::start_background(pool.clone(), Arc::new(remote), test_sync_config(), false);

    handle.request_sync(SyncScope::Project(101)).await.unwrap();
    wait_idle(&handle).await;

    let status = handle.status().await;
    assert!(status.last_error.is_none());
    assert_eq!(status.last_run_task_count, 2);
    let second = task_store::get_task(&pool, 2).await.unwrap().unwrap();
    assert_eq!(second.labels, vec!["bug".to_string()]);
}

#[tokio::test]
async fn test_label_history_failure_skips_only_that_issue() {
    let (_dir, pool) = setup_db().await;
    project::register_project(&pool, 101, "Portal").await.unwrap();

    let mut remote = FakeRemote::new();
    remote.issue_pages.insert(
        101,
        vec![
            vec![
                issue(1, 1, 101, "2024-03-07T10:00:00Z", &[]),
                issue(2, 2, 101, "2024-03-06T10:00:00Z", &[]),
            ],
            vec![issue(3, 3, 101, "2024-03-05T10:00:00Z", &[])],
        ],
    );
    remote.missing_label_events.insert((101, 1));
    let handle = SyncEngine::start_background(pool.clone(), Arc::new(remote), test_sync_config(), false);

    handle.request_sync(SyncScope::Project(101)).await.unwrap();
    wait_idle(&handle).await;

    assert!(task_store::get_task(&pool, 1).await.unwrap().is_none());
    assert!(task_store::get_task(&pool, 2).await.unwrap().is_some());
    assert!(task_store::get_task(&pool, 3).await.unwrap().is_some());

    let status = handle.status().await;
    assert_eq!(status.last_run_task_count, 2);
    assert_eq!(status.last_run_failed_projects, 1);
    let error = status.last_error.unwrap();
    assert!(error.contains("Portal (101)"), "{}", error);

    let log = sync_log::get_sync_log(&pool, 1).await.unwrap();
    assert_eq!(log[0].status, "partial");
}

#[tokio::test]
async fn test_label_history_is_reused_for_unchanged_issues() {
    let (_dir, pool) = setup_db().await;
    project::register_project(&pool, 101, "Portal").await.unwrap();

    let mut remote = FakeRemote::new();
    remote.issue_pages.insert(
        101,
        vec![vec![issue(5501, 55, 101, "2024-03-05T10:00:00Z", &["PARA REVISIÓN"])]],
    );
    remote.label_events.insert(
        (101, 55),
        json!([
            label_event(1, "EN EJECUCIÓN", "add", "2024-03-01T10:00:00Z", "ana"),
            label_event(2, "EN EJECUCIÓN", "remove", "2024-03-02T10:00:00Z", "ana"),
            label_event(3, "PARA REVISIÓN", "add", "2024-03-02T10:00:00Z", "ana")
        ]),
    );
    let remote = Arc::new(remote);
    let handle = SyncEngine::start_background(pool.clone(), remote.clone(), test_sync_config(), false);

    for _ in 0..2 {
        handle.request_sync(SyncScope::AllProjects).await.unwrap();
        wait_idle(&handle).await;
    }

    assert_eq!(remote.label_event_requests.load(Ordering::SeqCst), 1);
    let task = task_store::get_task(&pool, 5501).await.unwrap().unwrap();
    assert_eq!(task.label_history.len(), 3);
    assert_eq!(task.assignee.as_deref(), Some("luis"));
}

#[tokio::test]
async fn test_audit_sync_stores_wiki_and_push_activity() {
    let (_dir, pool) = setup_db().await;
    project::register_project(&pool, 101, "Portal").await.unwrap();

    let mut remote = FakeRemote::new();
    remote.events.insert(
        101,
        vec![
            json!({
                "id": 1, "action_name": "created", "target_type": "WikiPage::Meta",
                "target_title": "CU01 Login", "author_username": "ana",
                "created_at": "2024-03-02T10:00:00Z",
                "wiki_page": { "slug": "cu01-login", "title": "CU01 Login" }
            }),
            json!({
                "id": 2, "action_name": "pushed to", "author_username": "luis",
                "created_at": "2024-03-03T10:00:00Z",
                "push_data": { "commit_count": 2, "ref": "main" }
            }),
            json!({
                "id": 3, "action_name": "commented on", "target_type": "Note",
                "author_username": "ana", "created_at": "2024-03-03T11:00:00Z"
            }),
        ],
    );
    let handle = SyncEngine::start_background(pool.clone(), Arc::new(remote), test_sync_config(), false);

    assert!(handle.request_audit_sync(3, 2024).await.unwrap().is_accepted());
    wait_idle(&handle).await;

    let audit_status = handle.audit_status().await;
    assert!(audit_status.last_sync_time.is_some());
    assert_eq!(audit_status.last_run_task_count, 2);
    assert!(handle.status().await.last_sync_time.is_none());

    let stored = activity_store::scan_activity(
        &pool,
        &[101],
        ts("2024-03-01T00:00:00Z"),
        ts("2024-04-01T00:00:00Z"),
    )
    .await
    .unwrap();
    let kinds: Vec<ActivityKind> = stored.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![ActivityKind::Wiki, ActivityKind::Push]);

    let report = load_and_compute_audit(&pool, &Settings::default(), 3, 2024)
        .await
        .unwrap();
    let types: Vec<(String, AuditEventType)> = report
        .details
        .iter()
        .map(|d| (d.username.clone(), d.event_type))
        .collect();
    assert!(types.contains(&("ana".to_string(), AuditEventType::DocCreated)));
    assert!(types.contains(&("luis".to_string(), AuditEventType::Push)));

    let log = sync_log::get_sync_log(&pool, 1).await.unwrap();
    assert_eq!(log[0].operation, "audit_sync_complete");
}

#[tokio::test]
async fn test_invalid_audit_month_is_rejected_before_admission() {
    let (_dir, pool) = setup_db().await;
    let handle = SyncEngine::start_background(pool, Arc::new(FakeRemote::new()), test_sync_config(), false);

    assert!(handle.request_audit_sync(13, 2024).await.is_err());
    assert!(!handle.is_busy().await);
}

#[tokio::test]
async fn test_periodic_sync_runs_on_start() {
    let (_dir, pool) = setup_db().await;
    project::register_project(&pool, 101, "Portal").await.unwrap();

    let mut remote = FakeRemote::new();
    remote.issue_pages.insert(
        101,
        vec![vec![issue(1, 1, 101, "2024-03-05T10:00:00Z", &[])]],
    );
    let config = gitlab_task_monitor::config::SyncConfig {
        interval_secs: 3600,
        ..test_sync_config()
    };
    let handle = SyncEngine::start_background(pool.clone(), Arc::new(remote), config, true);

    for _ in 0..500 {
        if handle.status().await.last_sync_time.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(handle.status().await.last_sync_time.is_some());
    assert!(task_store::get_task(&pool, 1).await.unwrap().is_some());
    handle.stop().await;
}
