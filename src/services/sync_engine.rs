//! Background sync engine.
//!
//! A single runner task owns every sync run:
//! - manual requests arrive over an mpsc channel after admission by [`SyncHandle`]
//! - periodic all-project syncs fire on the configured interval
//! - only one run (task or audit) is active at a time; extra requests are
//!   rejected, never queued
//!
//! Remote failures never escape a run. They are retried when transient and
//! otherwise recorded against the project, which is reported through the
//! status snapshot and the sync log.

use crate::config::SyncConfig;
use crate::db::pool::DbPool;
use crate::db::sync_log::{self, LogStatus};
use crate::db::{activity_store, task_store};
use crate::error::AppError;
use crate::models::project::{self, MonitoredProject};
use crate::models::{
    ActivityEvent, ActivityKind, LabelAction, LabelChange, Task, TaskRecord, TimeStats,
};
use crate::services::audit::AuditWindow;
use crate::services::gitlab_client::{GitLabEvent, GitLabIssue, GitLabLabelEvent, RemoteSource};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{self, MissedTickBehavior};

/// Upper bound on a server-requested `Retry-After` wait.
const MAX_RETRY_AFTER_SECS: u64 = 300;

/// What a sync run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SyncScope {
    /// Issues of every active project.
    AllProjects,
    /// Issues of one project.
    Project(i64),
    /// Wiki and push activity of every active project for one month.
    AuditWindow { month: u32, year: i32 },
}

impl SyncScope {
    fn kind(&self) -> RunKind {
        match self {
            Self::AllProjects | Self::Project(_) => RunKind::Tasks,
            Self::AuditWindow { .. } => RunKind::Audit,
        }
    }
}

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AlreadySyncing,
}

/// Answer to a sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAdmission {
    Accepted,
    Rejected(RejectReason),
}

impl SyncAdmission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Status of one kind of sync (task or audit).
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    /// Whether a run of this kind is in flight.
    pub is_syncing: bool,

    /// Scope of the in-flight run.
    pub scope: Option<SyncScope>,

    /// When the in-flight run started.
    pub started_at: Option<DateTime<Utc>>,

    /// When the last run finished, whatever its outcome.
    pub last_sync_time: Option<DateTime<Utc>>,

    /// Per-project failures of the last run, joined with "; ".
    pub last_error: Option<String>,

    /// Projects covered by the last run.
    pub last_run_projects: usize,

    /// Projects of the last run that failed part-way.
    pub last_run_failed_projects: usize,

    /// Tasks (or activity events, for audit runs) stored by the last run.
    pub last_run_task_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Tasks,
    Audit,
}

/// Shared state behind the single-flight slot.
#[derive(Debug, Default)]
struct SyncState {
    active: Option<SyncScope>,
    tasks: SyncStatus,
    audit: SyncStatus,
}

impl SyncState {
    fn status_mut(&mut self, kind: RunKind) -> &mut SyncStatus {
        match kind {
            RunKind::Tasks => &mut self.tasks,
            RunKind::Audit => &mut self.audit,
        }
    }

    /// Claim the slot. Must be called under the write lock.
    fn try_begin(&mut self, scope: SyncScope) -> bool {
        if self.active.is_some() {
            return false;
        }
        self.active = Some(scope);
        let status = self.status_mut(scope.kind());
        status.is_syncing = true;
        status.scope = Some(scope);
        status.started_at = Some(Utc::now());
        true
    }

    fn finish(&mut self, scope: SyncScope, outcome: &RunOutcome) {
        self.active = None;
        let status = self.status_mut(scope.kind());
        status.is_syncing = false;
        status.scope = None;
        status.started_at = None;
        status.last_sync_time = Some(Utc::now());
        status.last_error = outcome.error_summary();
        status.last_run_projects = outcome.projects;
        status.last_run_failed_projects = outcome.failures.len();
        status.last_run_task_count = outcome.stored;
    }
}

/// Commands that can be sent to the runner.
#[derive(Debug)]
enum SyncCommand {
    /// Execute an already-admitted run.
    Run(SyncScope),

    /// Stop the runner after the current run.
    Stop,
}

/// Lightweight handle for requesting syncs and reading status.
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    state: Arc<RwLock<SyncState>>,
}

impl SyncHandle {
    /// Request a task sync. Rejected while any run is in flight.
    pub async fn request_sync(&self, scope: SyncScope) -> Result<SyncAdmission, AppError> {
        {
            let mut state = self.state.write().await;
            if !state.try_begin(scope) {
                log::info!("[sync] Rejected {:?}: a sync is already running", scope);
                return Ok(SyncAdmission::Rejected(RejectReason::AlreadySyncing));
            }
        }

        if self.command_tx.send(SyncCommand::Run(scope)).await.is_err() {
            self.state
                .write()
                .await
                .finish(scope, &RunOutcome::failed("Sync engine not running"));
            return Err(AppError::internal("Sync engine not running"));
        }

        Ok(SyncAdmission::Accepted)
    }

    /// Request an activity sync for one audit month.
    pub async fn request_audit_sync(
        &self,
        month: u32,
        year: i32,
    ) -> Result<SyncAdmission, AppError> {
        AuditWindow::new(month, year)?;
        self.request_sync(SyncScope::AuditWindow { month, year })
            .await
    }

    /// Snapshot of the task-sync status.
    pub async fn status(&self) -> SyncStatus {
        self.state.read().await.tasks.clone()
    }

    /// Snapshot of the audit-sync status.
    pub async fn audit_status(&self) -> SyncStatus {
        self.state.read().await.audit.clone()
    }

    /// Whether any run is in flight.
    pub async fn is_busy(&self) -> bool {
        self.state.read().await.active.is_some()
    }

    /// Ask the runner to exit once the current run is done.
    pub async fn stop(&self) {
        let _ = self.command_tx.send(SyncCommand::Stop).await;
    }
}

/// Retry bounds for a single remote request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&SyncConfig> for RetryPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms)),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Run `op`, retrying transient failures with doubling, jittered backoff.
///
/// A `Retry-After` hint replaces the computed delay. Non-transient errors and
/// the error of the last attempt are returned unchanged.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let wait = match e.retry_after_secs() {
                    Some(secs) => Duration::from_secs(secs.min(MAX_RETRY_AFTER_SECS)),
                    None => {
                        let base = policy.backoff(attempt);
                        let jitter_ms = base.as_millis() as u64 / 4;
                        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
                        base + Duration::from_millis(jitter)
                    }
                };
                log::warn!(
                    "[sync] {} failed (attempt {}/{}): {}; retrying in {:?}",
                    what,
                    attempt,
                    policy.max_retries + 1,
                    e,
                    wait
                );
                time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Result of one project within a run.
#[derive(Debug, Default)]
struct ProjectOutcome {
    stored: usize,
    skipped: usize,
    failed: usize,
    /// First failure of the project.
    error: Option<String>,
}

impl ProjectOutcome {
    fn record_failure(&mut self, project: &MonitoredProject, e: &AppError) {
        self.failed += 1;
        if self.error.is_none() {
            self.error = Some(format!("{} ({}): {}", project.name, project.id, e));
        }
    }
}

/// Aggregate result of a run.
#[derive(Debug, Default)]
struct RunOutcome {
    projects: usize,
    stored: usize,
    skipped: usize,
    failures: Vec<String>,
}

impl RunOutcome {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            failures: vec![message.into()],
            ..Default::default()
        }
    }

    fn absorb(&mut self, outcome: ProjectOutcome) {
        self.projects += 1;
        self.stored += outcome.stored;
        self.skipped += outcome.skipped;
        if let Some(error) = outcome.error {
            self.failures.push(error);
        }
    }

    fn error_summary(&self) -> Option<String> {
        (!self.failures.is_empty()).then(|| self.failures.join("; "))
    }

    fn log_status(&self) -> LogStatus {
        match (self.failures.len(), self.projects) {
            (0, _) => LogStatus::Success,
            (failed, total) if failed < total || self.stored > 0 => LogStatus::Partial,
            _ => LogStatus::Error,
        }
    }
}

/// Background sync engine.
pub struct SyncEngine {
    pool: DbPool,
    remote: Arc<dyn RemoteSource>,
    config: SyncConfig,
    retry: RetryPolicy,
    state: Arc<RwLock<SyncState>>,
}

impl SyncEngine {
    /// Start the runner task and return its handle.
    ///
    /// With `periodic` set and a non-zero interval, an all-project sync runs
    /// immediately and then every `interval_secs`; a tick that finds another
    /// run in flight is skipped.
    pub fn start_background(
        pool: DbPool,
        remote: Arc<dyn RemoteSource>,
        config: SyncConfig,
        periodic: bool,
    ) -> SyncHandle {
        let (tx, mut rx) = mpsc::channel::<SyncCommand>(16);
        let state = Arc::new(RwLock::new(SyncState::default()));

        let engine = SyncEngine {
            pool,
            remote,
            retry: RetryPolicy::from(&config),
            config,
            state: state.clone(),
        };

        tokio::spawn(async move {
            let periodic = periodic && engine.config.interval_secs > 0;
            let mut interval = time::interval(Duration::from_secs(engine.config.interval_secs.max(1)));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            if periodic {
                log::info!(
                    "[sync] Periodic sync every {}s",
                    engine.config.interval_secs
                );
            }

            loop {
                tokio::select! {
                    _ = interval.tick(), if periodic => {
                        let admitted = engine.state.write().await.try_begin(SyncScope::AllProjects);
                        if admitted {
                            log::info!("[sync] Running periodic sync");
                            engine.execute(SyncScope::AllProjects).await;
                        } else {
                            log::debug!("[sync] Periodic tick skipped: a sync is already running");
                        }
                    }
                    cmd = rx.recv() => {
                        match cmd {
                            Some(SyncCommand::Run(scope)) => engine.execute(scope).await,
                            Some(SyncCommand::Stop) | None => break,
                        }
                    }
                }
            }
            log::info!("[sync] Sync engine stopped");
        });

        SyncHandle {
            command_tx: tx,
            state,
        }
    }

    /// Execute an admitted run and release the slot. Never fails.
    async fn execute(&self, scope: SyncScope) {
        let started = Instant::now();

        let outcome = match scope {
            SyncScope::AllProjects => self.sync_tasks(None).await,
            SyncScope::Project(id) => self.sync_tasks(Some(id)).await,
            SyncScope::AuditWindow { month, year } => self.sync_activity(month, year).await,
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        self.state.write().await.finish(scope, &outcome);

        log::info!(
            "[sync] {:?} finished in {}ms: {} projects, {} stored, {} skipped, {} failed",
            scope,
            duration_ms,
            outcome.projects,
            outcome.stored,
            outcome.skipped,
            outcome.failures.len()
        );
        for failure in &outcome.failures {
            log::error!("[sync] {}", failure);
        }

        let operation = match scope.kind() {
            RunKind::Tasks => "sync_complete",
            RunKind::Audit => "audit_sync_complete",
        };
        let project_id = match scope {
            SyncScope::Project(id) => Some(id),
            _ => None,
        };
        let message = format!(
            "{} projects, {} stored, {} skipped{}",
            outcome.projects,
            outcome.stored,
            outcome.skipped,
            outcome
                .error_summary()
                .map(|e| format!("; errors: {}", e))
                .unwrap_or_default()
        );
        if let Err(e) = sync_log::log_sync_operation(
            &self.pool,
            operation,
            outcome.log_status(),
            project_id,
            Some(&message),
            Some(duration_ms),
        )
        .await
        {
            log::error!("[sync] Failed to write sync log: {}", e);
        }
    }

    /// Resolve the projects a run covers. Unknown or inactive projects yield none.
    async fn resolve_projects(
        &self,
        only: Option<i64>,
    ) -> Result<Vec<MonitoredProject>, AppError> {
        match only {
            None => project::list_active_projects(&self.pool).await,
            Some(id) => match project::get_project(&self.pool, id).await? {
                Some(p) if p.is_active => Ok(vec![p]),
                Some(_) => {
                    log::info!("[sync] Project {} is inactive; nothing to sync", id);
                    Ok(Vec::new())
                }
                None => {
                    log::info!("[sync] Project {} is not registered; nothing to sync", id);
                    Ok(Vec::new())
                }
            },
        }
    }

    async fn sync_tasks(&self, only: Option<i64>) -> RunOutcome {
        let projects = match self.resolve_projects(only).await {
            Ok(projects) => projects,
            Err(e) => return RunOutcome::failed(format!("Failed to load projects: {}", e)),
        };
        if projects.is_empty() {
            log::info!("[sync] No active projects to sync");
        }

        let results: Vec<ProjectOutcome> = stream::iter(projects)
            .map(|p| async move { self.sync_project(&p).await })
            .buffer_unordered(self.config.max_concurrent_projects.max(1))
            .collect()
            .await;

        let mut outcome = RunOutcome::default();
        for result in results {
            outcome.absorb(result);
        }
        outcome
    }

    /// Page through a project's issues and store each one.
    async fn sync_project(&self, project: &MonitoredProject) -> ProjectOutcome {
        let mut outcome = ProjectOutcome::default();
        let mut page = 1u32;

        loop {
            let what = format!("project {} issues page {}", project.id, page);
            let batch = match retry_transient(&self.retry, &what, || {
                self.remote.list_issues_page(project.id, page)
            })
            .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    outcome.record_failure(project, &e);
                    return outcome;
                }
            };

            for raw in batch.items {
                match self.sync_issue(project.id, raw).await {
                    Ok(()) => outcome.stored += 1,
                    Err(AppError::DataShape { message }) => {
                        log::warn!("[sync] Skipping malformed issue: {}", message);
                        outcome.skipped += 1;
                    }
                    // The issue stays unsynced and is retried next run.
                    Err(e) => {
                        log::warn!("[sync] Issue failed in project {}: {}", project.id, e);
                        outcome.record_failure(project, &e);
                    }
                }
            }

            match batch.next_page {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        if outcome.failed > 1 {
            if let Some(error) = outcome.error.as_mut() {
                error.push_str(&format!(" ({} issues failed)", outcome.failed));
            }
        }

        log::debug!(
            "[sync] Project {} done: {} stored, {} skipped, {} failed",
            project.id,
            outcome.stored,
            outcome.skipped,
            outcome.failed
        );
        outcome
    }

    async fn sync_issue(&self, project_id: i64, raw: serde_json::Value) -> Result<(), AppError> {
        let issue: GitLabIssue = serde_json::from_value(raw.clone()).map_err(|e| {
            let id = raw.get("id").map(|v| v.to_string()).unwrap_or_default();
            AppError::data_shape(format!("project {} issue {}: {}", project_id, id, e))
        })?;

        // Label events only change when the issue does.
        let label_history = match task_store::get_task_version(&self.pool, issue.id).await? {
            Some(stored) if stored == issue.updated_at => {
                task_store::get_task(&self.pool, issue.id)
                    .await?
                    .map(|t| t.label_history)
                    .unwrap_or_default()
            }
            _ => {
                let what = format!("project {} issue #{} label events", project_id, issue.iid);
                let events = retry_transient(&self.retry, &what, || {
                    self.remote.list_label_events(project_id, issue.iid)
                })
                .await?;
                label_history_from_events(events)
            }
        };

        let record = TaskRecord {
            task: task_from_issue(issue, label_history),
            raw_data: raw,
        };
        task_store::upsert_task(&self.pool, &record, Utc::now()).await
    }

    async fn sync_activity(&self, month: u32, year: i32) -> RunOutcome {
        let window = match AuditWindow::new(month, year) {
            Ok(window) => window,
            Err(e) => return RunOutcome::failed(e.to_string()),
        };
        let projects = match self.resolve_projects(None).await {
            Ok(projects) => projects,
            Err(e) => return RunOutcome::failed(format!("Failed to load projects: {}", e)),
        };

        let results: Vec<ProjectOutcome> = stream::iter(projects)
            .map(|p| async move { self.sync_project_activity(&p, &window).await })
            .buffer_unordered(self.config.max_concurrent_projects.max(1))
            .collect()
            .await;

        let mut outcome = RunOutcome::default();
        for result in results {
            outcome.absorb(result);
        }
        outcome
    }

    /// Fetch a project's activity feed for the window and store wiki and push events.
    async fn sync_project_activity(
        &self,
        project: &MonitoredProject,
        window: &AuditWindow,
    ) -> ProjectOutcome {
        let (after, before) = window.fetch_bounds();
        let mut outcome = ProjectOutcome::default();
        let mut page = 1u32;

        loop {
            let what = format!("project {} events page {}", project.id, page);
            let batch = match retry_transient(&self.retry, &what, || {
                self.remote.list_events_page(project.id, after, before, page)
            })
            .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    outcome.record_failure(project, &e);
                    return outcome;
                }
            };

            for raw in batch.items {
                let event = match serde_json::from_value::<GitLabEvent>(raw) {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("[sync] Skipping malformed event in project {}: {}", project.id, e);
                        outcome.skipped += 1;
                        continue;
                    }
                };
                let Some(activity) = activity_from_event(project.id, &event) else {
                    continue;
                };
                if let Err(e) = activity_store::upsert_activity(&self.pool, &activity).await {
                    outcome.record_failure(project, &e);
                    return outcome;
                }
                outcome.stored += 1;
            }

            match batch.next_page {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }

        outcome
    }
}

/// Convert GitLab label events to the stored timeline.
///
/// Events for since-deleted labels carry no name and are dropped.
pub fn label_history_from_events(events: Vec<GitLabLabelEvent>) -> Vec<LabelChange> {
    let mut history: Vec<LabelChange> = events
        .into_iter()
        .filter_map(|event| {
            let label = event.label?.name;
            let action = match event.action.as_str() {
                "add" => LabelAction::Add,
                "remove" => LabelAction::Remove,
                other => {
                    log::debug!("[sync] Ignoring label event action {:?}", other);
                    return None;
                }
            };
            Some(LabelChange {
                label,
                action,
                at: event.created_at,
                actor: event.user.map(|u| u.username),
            })
        })
        .collect();
    history.sort_by_key(|c| c.at);
    history
}

/// Build a task snapshot from an issue and its label history.
pub fn task_from_issue(issue: GitLabIssue, label_history: Vec<LabelChange>) -> Task {
    let assignee = issue.primary_assignee().map(|u| u.username.clone());
    Task {
        task_id: issue.id,
        project_id: issue.project_id,
        iid: issue.iid,
        title: issue.title,
        description: issue.description,
        state: issue.state,
        web_url: issue.web_url,
        author: issue.author.username,
        assignee,
        milestone: issue.milestone.map(|m| m.title),
        labels: issue.labels,
        time_stats: issue.time_stats.map(|t| TimeStats {
            time_estimate: t.time_estimate,
            total_time_spent: t.total_time_spent,
        }),
        created_at: issue.created_at,
        updated_at: issue.updated_at,
        closed_at: issue.closed_at,
        label_history,
        first_seen_at: None,
        last_synced_at: None,
    }
}

/// Keep wiki and push events with a known author; drop everything else.
pub fn activity_from_event(project_id: i64, event: &GitLabEvent) -> Option<ActivityEvent> {
    let kind = if event.is_wiki() {
        ActivityKind::Wiki
    } else if event.is_push() {
        ActivityKind::Push
    } else {
        return None;
    };
    let Some(username) = event.username() else {
        log::debug!("[sync] Skipping event {} without author", event.id);
        return None;
    };

    let wiki_page = event.wiki_page.as_ref();
    Some(ActivityEvent {
        project_id: event.project_id.unwrap_or(project_id),
        event_id: event.id,
        kind,
        action_name: event.action_name.clone(),
        username: username.to_string(),
        target_title: event
            .target_title
            .clone()
            .or_else(|| wiki_page.and_then(|w| w.title.clone())),
        wiki_slug: wiki_page.and_then(|w| w.slug.clone()),
        ref_name: event.push_data.as_ref().and_then(|p| p.ref_name.clone()),
        commit_count: event.push_data.as_ref().map(|p| p.commit_count),
        created_at: event.created_at,
    })
}
