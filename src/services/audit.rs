//! Monthly audit aggregation.
//!
//! Turns stored task snapshots and activity events into per-user summaries and
//! a flat list of detail rows for one calendar month. Everything here is a pure
//! function of what is in the store; reports are recomputed per request.

use crate::config::{AuditConfig, Settings};
use crate::db::{activity_store, task_store};
use crate::error::AppError;
use crate::models::project::{self, MonitoredProject};
use crate::models::{
    ActivityEvent, ActivityKind, AuditEvent, AuditEventType, AuditReport, AuditSummary, Task,
};
use crate::services::cycle_time::{stage_entries, Stage, StageClassifier};
use crate::services::doc_classifier::{classify_page, wiki_event_type};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A calendar month, `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditWindow {
    pub month: u32,
    pub year: i32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl AuditWindow {
    pub fn new(month: u32, year: i32) -> Result<Self, AppError> {
        if !(1..=12).contains(&month) {
            return Err(AppError::invalid_input_field("Month must be 1-12", "month"));
        }
        if !(1970..=9999).contains(&year) {
            return Err(AppError::invalid_input_field(
                "Year must be 1970-9999",
                "year",
            ));
        }

        let (next_year, next_month) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };
        let start = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single();
        let end = Utc
            .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
            .single();

        match (start, end) {
            (Some(start), Some(end)) => Ok(Self {
                month,
                year,
                start,
                end,
            }),
            _ => Err(AppError::invalid_input("Invalid audit month")),
        }
    }

    /// Window containing `ts`.
    pub fn containing(ts: DateTime<Utc>) -> Result<Self, AppError> {
        Self::new(ts.month(), ts.year())
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Exclusive `after`/`before` dates for the activity feed, padded by a day
    /// on each side.
    pub fn fetch_bounds(&self) -> (NaiveDate, NaiveDate) {
        let after = (self.start - Duration::days(1)).date_naive();
        let before = (self.end + Duration::days(1)).date_naive();
        (after, before)
    }
}

/// Whether a review `reviewed_at` of an issue raised at `raised_at` met the SLA.
///
/// Partial days count as whole days.
pub fn reviewed_on_time(
    raised_at: DateTime<Utc>,
    reviewed_at: DateTime<Utc>,
    sla_days: i64,
) -> bool {
    const DAY_MS: i64 = 86_400_000;
    let elapsed = (reviewed_at - raised_at).num_milliseconds().max(0);
    let days = (elapsed + DAY_MS - 1) / DAY_MS;
    days <= sla_days
}

struct Builder<'a> {
    window: &'a AuditWindow,
    projects: HashMap<i64, &'a MonitoredProject>,
    events: Vec<AuditEvent>,
}

impl<'a> Builder<'a> {
    fn push(
        &mut self,
        username: &str,
        project_id: i64,
        event_type: AuditEventType,
        reference_id: String,
        event_date: DateTime<Utc>,
    ) -> Option<&mut AuditEvent> {
        if !self.window.contains(event_date) {
            return None;
        }
        let project = self.projects.get(&project_id)?;
        self.events.push(AuditEvent {
            username: username.to_string(),
            project_id,
            project_name: project.name.clone(),
            event_type,
            reference_id,
            event_date,
            on_time: None,
            sequence: None,
        });
        self.events.last_mut()
    }
}

fn issue_events(
    builder: &mut Builder<'_>,
    task: &Task,
    config: &AuditConfig,
    classifier: &StageClassifier,
) {
    let reference = task.reference();
    let reviewer = task.assignee.as_deref().unwrap_or(&task.author);

    builder.push(
        &task.author,
        task.project_id,
        AuditEventType::IssueRaised,
        reference.clone(),
        task.created_at,
    );

    let entries = stage_entries(task, classifier);

    if let Some(review) = entries.iter().find(|e| e.stage == Stage::Review) {
        let on_time = reviewed_on_time(task.created_at, review.at, config.review_sla_days);
        if let Some(event) = builder.push(
            reviewer,
            task.project_id,
            AuditEventType::IssueReviewed,
            reference.clone(),
            review.at,
        ) {
            event.on_time = Some(on_time);
        }
    }

    let mut previous: Option<Stage> = None;
    let mut sequence = 0u32;
    for entry in &entries {
        let bounced = entry.stage == Stage::Execution
            && matches!(previous, Some(Stage::Review | Stage::FunctionalReview));
        if bounced {
            sequence += 1;
            let actor = entry
                .actor
                .as_deref()
                .or(task.assignee.as_deref())
                .unwrap_or(&task.author);
            if let Some(event) = builder.push(
                actor,
                task.project_id,
                AuditEventType::IssueBounced,
                reference.clone(),
                entry.at,
            ) {
                event.sequence = Some(sequence);
            }
        }
        previous = Some(entry.stage);
    }
}

fn activity_events(builder: &mut Builder<'_>, activity: &[ActivityEvent]) {
    // Latest edit per (project, type, page, user); an edit burst counts once.
    let mut docs: BTreeMap<(i64, AuditEventType, String, String), DateTime<Utc>> =
        BTreeMap::new();

    for event in activity {
        match event.kind {
            ActivityKind::Push => {
                builder.push(
                    &event.username,
                    event.project_id,
                    AuditEventType::Push,
                    event.event_id.to_string(),
                    event.created_at,
                );
            }
            ActivityKind::Wiki => {
                let title = event.target_title.as_deref().unwrap_or_default();
                let slug = event.wiki_slug.as_deref().unwrap_or_default();
                let Some(kind) = classify_page(title, slug) else {
                    log::debug!("[audit] Ignoring wiki page {:?} ({:?})", title, slug);
                    continue;
                };
                let Some(event_type) = wiki_event_type(kind, &event.action_name) else {
                    log::debug!(
                        "[audit] Ignoring wiki action {:?} on {:?}",
                        event.action_name,
                        title
                    );
                    continue;
                };
                let reference = [slug, title]
                    .into_iter()
                    .find(|s| !s.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| event.event_id.to_string());

                if !builder.window.contains(event.created_at) {
                    continue;
                }
                let key = (event.project_id, event_type, reference, event.username.clone());
                let latest = docs.entry(key).or_insert(event.created_at);
                if event.created_at > *latest {
                    *latest = event.created_at;
                }
            }
        }
    }

    for ((project_id, event_type, reference, username), date) in docs {
        builder.push(&username, project_id, event_type, reference, date);
    }
}

/// Merge each raise with the review of the same issue by the same user.
fn merge_issue_rows(events: &[AuditEvent]) -> Vec<AuditEvent> {
    let key = |e: &AuditEvent| (e.project_id, e.reference_id.clone(), e.username.clone());

    let reviews: HashMap<_, &AuditEvent> = events
        .iter()
        .filter(|e| e.event_type == AuditEventType::IssueReviewed)
        .map(|e| (key(e), e))
        .collect();
    let raises: BTreeSet<_> = events
        .iter()
        .filter(|e| e.event_type == AuditEventType::IssueRaised)
        .map(key)
        .collect();

    let mut details = Vec::with_capacity(events.len());
    for event in events {
        match event.event_type {
            AuditEventType::IssueRaised => match reviews.get(&key(event)) {
                Some(review) => details.push(AuditEvent {
                    event_type: AuditEventType::IssueRaisedReviewed,
                    event_date: event.event_date.max(review.event_date),
                    on_time: review.on_time,
                    ..event.clone()
                }),
                None => details.push(event.clone()),
            },
            AuditEventType::IssueReviewed if raises.contains(&key(event)) => {}
            _ => details.push(event.clone()),
        }
    }
    details
}

/// Build the audit report for one window.
///
/// Tasks and activity of projects absent from `projects` are ignored, so the
/// caller passes only active projects.
pub fn compute_audit(
    tasks: &[Task],
    activity: &[ActivityEvent],
    projects: &[MonitoredProject],
    config: &AuditConfig,
    classifier: &StageClassifier,
    window: &AuditWindow,
) -> AuditReport {
    let mut builder = Builder {
        window,
        projects: projects
            .iter()
            .filter(|p| p.is_active)
            .map(|p| (p.id, p))
            .collect(),
        events: Vec::new(),
    };

    for task in tasks {
        issue_events(&mut builder, task, config, classifier);
    }
    activity_events(&mut builder, activity);

    let mut events = builder.events;
    let tracked: BTreeSet<String> = if config.tracked_users.is_empty() {
        events.iter().map(|e| e.username.clone()).collect()
    } else {
        let tracked: BTreeSet<String> = config.tracked_users.iter().cloned().collect();
        events.retain(|e| tracked.contains(&e.username));
        tracked
    };

    let mut summaries: BTreeMap<&str, AuditSummary> = tracked
        .iter()
        .map(|u| (u.as_str(), AuditSummary::empty(u.as_str(), window.month, window.year)))
        .collect();
    for event in &events {
        if let Some(summary) = summaries.get_mut(event.username.as_str()) {
            summary.record(event);
        }
    }

    let mut details = merge_issue_rows(&events);
    details.sort_by(|a, b| {
        b.event_date
            .cmp(&a.event_date)
            .then_with(|| a.project_id.cmp(&b.project_id))
            .then_with(|| a.reference_id.cmp(&b.reference_id))
            .then_with(|| a.event_type.cmp(&b.event_type))
            .then_with(|| a.sequence.cmp(&b.sequence))
    });

    AuditReport {
        summaries: summaries.into_values().collect(),
        details,
    }
}

/// Load the window's data from the store and compute the report.
pub async fn load_and_compute_audit(
    pool: &sqlx::SqlitePool,
    settings: &Settings,
    month: u32,
    year: i32,
) -> Result<AuditReport, AppError> {
    let window = AuditWindow::new(month, year)?;
    let projects = project::list_active_projects(pool).await?;
    if projects.is_empty() {
        log::info!("[audit] No active projects; {}/{} report is empty", month, year);
    }
    let project_ids: Vec<i64> = projects.iter().map(|p| p.id).collect();

    // A raise, review or bounce inside the window implies the issue was
    // created before its end and updated after its start.
    let tasks = task_store::scan_tasks(
        pool,
        &task_store::TaskFilter {
            project_ids: Some(project_ids.clone()),
            created_before: Some(window.end),
            updated_since: Some(window.start),
            ..Default::default()
        },
    )
    .await?;
    let activity =
        activity_store::scan_activity(pool, &project_ids, window.start, window.end).await?;

    let report = compute_audit(
        &tasks,
        &activity,
        &projects,
        &settings.audit,
        &settings.stages.classifier(),
        &window,
    );
    log::debug!(
        "[audit] {}/{}: {} tasks, {} activity events -> {} summaries, {} details",
        month,
        year,
        tasks.len(),
        activity.len(),
        report.summaries.len(),
        report.details.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LabelAction, LabelChange};

    fn ts(month: u32, day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, month, day, hour, 0, 0).unwrap()
    }

    fn project(id: i64, active: bool) -> MonitoredProject {
        MonitoredProject {
            id,
            name: format!("P{}", id),
            is_active: active,
            created_at: 0,
        }
    }

    fn add(label: &str, at: DateTime<Utc>, actor: Option<&str>) -> LabelChange {
        LabelChange {
            label: label.into(),
            action: LabelAction::Add,
            at,
            actor: actor.map(str::to_string),
        }
    }

    fn issue(iid: i64, created_at: DateTime<Utc>, history: Vec<LabelChange>) -> Task {
        Task {
            task_id: 1000 + iid,
            project_id: 101,
            iid,
            title: format!("Issue {}", iid),
            description: None,
            state: "opened".into(),
            web_url: String::new(),
            author: "ana".into(),
            assignee: None,
            milestone: None,
            labels: vec![],
            time_stats: None,
            created_at,
            updated_at: created_at,
            closed_at: None,
            label_history: history,
            first_seen_at: None,
            last_synced_at: None,
        }
    }

    fn wiki(
        event_id: i64,
        user: &str,
        title: &str,
        slug: &str,
        action: &str,
        at: DateTime<Utc>,
    ) -> ActivityEvent {
        ActivityEvent {
            project_id: 101,
            event_id,
            kind: ActivityKind::Wiki,
            action_name: action.into(),
            username: user.into(),
            target_title: Some(title.into()),
            wiki_slug: Some(slug.into()),
            ref_name: None,
            commit_count: None,
            created_at: at,
        }
    }

    fn run(tasks: &[Task], activity: &[ActivityEvent], config: &AuditConfig) -> AuditReport {
        compute_audit(
            tasks,
            activity,
            &[project(101, true)],
            config,
            &StageClassifier::default(),
            &AuditWindow::new(3, 2024).unwrap(),
        )
    }

    #[test]
    fn test_window_bounds() {
        let window = AuditWindow::new(12, 2024).unwrap();
        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert!(!window.contains(window.end));

        let (after, before) = window.fetch_bounds();
        assert_eq!(after, NaiveDate::from_ymd_opt(2024, 11, 30).unwrap());
        assert_eq!(before, NaiveDate::from_ymd_opt(2025, 1, 2).unwrap());

        assert!(AuditWindow::new(13, 2024).is_err());
        assert!(AuditWindow::new(0, 2024).is_err());
        assert!(AuditWindow::new(3, 1969).is_err());
    }

    #[test]
    fn test_review_sla_uses_whole_days() {
        assert!(reviewed_on_time(ts(3, 1, 9), ts(3, 3, 9), 3));
        assert!(reviewed_on_time(ts(3, 1, 9), ts(3, 4, 9), 3));
        assert!(!reviewed_on_time(ts(3, 1, 9), ts(3, 4, 10), 3));
        assert!(!reviewed_on_time(ts(3, 1, 9), ts(3, 5, 9), 3));
    }

    #[test]
    fn test_issue_55_late_and_on_time_reviews() {
        let late = issue(55, ts(3, 1, 9), vec![add("PARA REVISIÓN", ts(3, 5, 9), None)]);
        let report = run(&[late], &[], &AuditConfig::default());
        let summary = &report.summaries[0];
        assert_eq!(summary.issues_reviewed, 1);
        assert_eq!(summary.issues_reviewed_on_time, 0);
        assert_eq!(summary.on_time_ratio, Some(0.0));

        let prompt = issue(55, ts(3, 1, 9), vec![add("PARA REVISIÓN", ts(3, 3, 9), None)]);
        let report = run(&[prompt], &[], &AuditConfig::default());
        assert_eq!(report.summaries[0].issues_reviewed_on_time, 1);
    }

    #[test]
    fn test_raise_and_review_merge_into_one_row() {
        let task = issue(55, ts(3, 1, 9), vec![add("PARA REVISIÓN", ts(3, 3, 9), None)]);
        let report = run(&[task], &[], &AuditConfig::default());

        assert_eq!(report.details.len(), 1);
        let row = &report.details[0];
        assert_eq!(row.event_type, AuditEventType::IssueRaisedReviewed);
        assert_eq!(row.event_date, ts(3, 3, 9));
        assert_eq!(row.on_time, Some(true));

        let summary = &report.summaries[0];
        assert_eq!(summary.issues_raised, 1);
        assert_eq!(summary.issues_reviewed, 1);
    }

    #[test]
    fn test_review_by_other_user_is_not_merged() {
        let mut task = issue(55, ts(3, 1, 9), vec![add("PARA REVISIÓN", ts(3, 3, 9), None)]);
        task.assignee = Some("luis".into());
        let report = run(&[task], &[], &AuditConfig::default());

        assert_eq!(report.details.len(), 2);
        assert_eq!(report.details[0].event_type, AuditEventType::IssueReviewed);
        assert_eq!(report.details[0].username, "luis");
        assert_eq!(report.details[1].event_type, AuditEventType::IssueRaised);
    }

    #[test]
    fn test_two_bounces_are_distinct_rows() {
        let task = issue(
            55,
            ts(2, 20, 9),
            vec![
                add("EN EJECUCIÓN", ts(2, 21, 9), Some("ana")),
                add("PARA REVISIÓN", ts(3, 2, 9), Some("ana")),
                add("EN EJECUCIÓN", ts(3, 4, 9), Some("qa1")),
                add("PARA REVISIÓN", ts(3, 6, 9), Some("ana")),
                add("EN EJECUCIÓN", ts(3, 8, 9), Some("qa1")),
            ],
        );
        let report = run(&[task], &[], &AuditConfig::default());

        let bounces: Vec<&AuditEvent> = report
            .details
            .iter()
            .filter(|e| e.event_type == AuditEventType::IssueBounced)
            .collect();
        assert_eq!(bounces.len(), 2);
        assert_eq!(bounces[0].sequence, Some(2));
        assert_eq!(bounces[1].sequence, Some(1));
        assert!(bounces.iter().all(|b| b.username == "qa1" && b.reference_id == "#55"));

        let qa = report.summaries.iter().find(|s| s.username == "qa1").unwrap();
        assert_eq!(qa.issues_bounced, 2);
    }

    #[test]
    fn test_bounce_from_functional_review() {
        let task = issue(
            9,
            ts(3, 1, 9),
            vec![
                add("REVISIÓN FUNCIONAL", ts(3, 2, 9), None),
                add("EN EJECUCIÓN", ts(3, 3, 9), None),
            ],
        );
        let report = run(&[task], &[], &AuditConfig::default());
        assert_eq!(report.summaries[0].issues_bounced, 1);
        // Functional review is not a plain review.
        assert_eq!(report.summaries[0].issues_reviewed, 0);
    }

    #[test]
    fn test_tracked_users_keep_zero_rows_and_drop_others() {
        let task = issue(55, ts(3, 1, 9), vec![]);
        let config = AuditConfig {
            tracked_users: vec!["qa1".into(), "qa2".into()],
            review_sla_days: 3,
        };
        let report = run(&[task], &[], &config);

        let names: Vec<&str> = report.summaries.iter().map(|s| s.username.as_str()).collect();
        assert_eq!(names, vec!["qa1", "qa2"]);
        assert!(report.summaries.iter().all(|s| s.issues_raised == 0 && s.on_time_ratio.is_none()));
        assert!(report.details.is_empty());
    }

    #[test]
    fn test_events_outside_window_or_inactive_project_are_dropped() {
        let before = issue(1, ts(2, 28, 9), vec![]);
        let mut inactive = issue(2, ts(3, 2, 9), vec![]);
        inactive.project_id = 202;
        let report = compute_audit(
            &[before, inactive],
            &[],
            &[project(101, true), project(202, false)],
            &AuditConfig::default(),
            &StageClassifier::default(),
            &AuditWindow::new(3, 2024).unwrap(),
        );
        assert!(report.details.is_empty());
        assert!(report.summaries.is_empty());
    }

    #[test]
    fn test_doc_edits_deduplicated_pushes_not() {
        let activity = vec![
            wiki(1, "ana", "CU01 Login", "cu01-login", "updated", ts(3, 2, 9)),
            wiki(2, "ana", "CU01 Login", "cu01-login", "updated", ts(3, 9, 9)),
            wiki(3, "ana", "Manual de usuario", "manual", "created", ts(3, 3, 9)),
            wiki(4, "ana", "Home", "home", "updated", ts(3, 3, 9)),
            ActivityEvent {
                kind: ActivityKind::Push,
                action_name: "pushed to".into(),
                target_title: None,
                wiki_slug: None,
                ref_name: Some("main".into()),
                commit_count: Some(2),
                ..wiki(5, "ana", "", "", "", ts(3, 4, 9))
            },
            ActivityEvent {
                kind: ActivityKind::Push,
                action_name: "pushed to".into(),
                target_title: None,
                wiki_slug: None,
                ref_name: Some("main".into()),
                commit_count: Some(1),
                ..wiki(6, "ana", "", "", "", ts(3, 4, 10))
            },
        ];
        let report = run(&[], &activity, &AuditConfig::default());

        let summary = &report.summaries[0];
        assert_eq!(summary.docs_updated, 1);
        assert_eq!(summary.manuals_created, 1);
        assert_eq!(summary.pushes, 2);

        let doc = report
            .details
            .iter()
            .find(|e| e.event_type == AuditEventType::DocUpdated)
            .unwrap();
        assert_eq!(doc.event_date, ts(3, 9, 9));
        assert_eq!(doc.reference_id, "cu01-login");
        assert_eq!(report.details[0].event_date, ts(3, 9, 9));
    }

    #[test]
    fn test_deleted_wiki_pages_are_not_counted() {
        let activity = vec![
            wiki(1, "ana", "CU01 Login", "cu01-login", "destroyed", ts(3, 2, 9)),
            wiki(2, "ana", "Manual de usuario", "manual", "destroyed", ts(3, 3, 9)),
        ];
        let report = run(&[], &activity, &AuditConfig::default());

        assert!(report.details.is_empty());
        assert!(report
            .summaries
            .iter()
            .all(|s| s.docs_updated == 0 && s.manuals_updated == 0));
    }
}
