//! Cycle-time derivation from an issue's label history.
//!
//! Metrics are computed on read and never stored. A stage that was never
//! entered yields `None`, distinct from `Some(0.0)` for an instant visit.

use crate::models::{CycleMetrics, LabelAction, Task};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Canonical workflow stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Execution,
    Review,
    FunctionalReview,
}

/// Maps label names to stages by case-insensitive keyword match.
///
/// Rules are checked in order, so the more specific stage must come first
/// ("revisión funcional" is a functional review, not a plain review).
#[derive(Debug, Clone)]
pub struct StageClassifier {
    rules: Vec<(Stage, Vec<String>)>,
}

impl StageClassifier {
    pub fn new(rules: Vec<(Stage, Vec<String>)>) -> Self {
        let rules = rules
            .into_iter()
            .map(|(stage, words)| {
                let words = words
                    .into_iter()
                    .map(|w| w.trim().to_lowercase())
                    .filter(|w| !w.is_empty())
                    .collect();
                (stage, words)
            })
            .collect();
        Self { rules }
    }

    pub fn classify(&self, label: &str) -> Option<Stage> {
        let label = label.to_lowercase();
        self.rules
            .iter()
            .find(|(_, words)| words.iter().any(|w| label.contains(w.as_str())))
            .map(|(stage, _)| *stage)
    }
}

impl Default for StageClassifier {
    fn default() -> Self {
        crate::config::StageKeywords::default().classifier()
    }
}

/// A period during which a stage label was attached.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelInterval {
    pub label: String,
    pub stage: Stage,
    pub start: DateTime<Utc>,
    /// `None` while the label has not been removed.
    pub removed_at: Option<DateTime<Utc>>,
}

/// A label addition that moved the issue into a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageEntry {
    pub stage: Stage,
    pub at: DateTime<Utc>,
    pub actor: Option<String>,
}

fn time_ordered(task: &Task) -> Vec<&crate::models::LabelChange> {
    let mut changes: Vec<_> = task.label_history.iter().collect();
    changes.sort_by_key(|c| c.at);
    changes
}

/// Rebuild stage-label intervals from the label timeline.
///
/// An `add` opens an interval; a `remove` closes the latest open interval of
/// the same label. A `remove` without a matching `add` (history older than the
/// label events API) is treated as attached since the issue was created.
pub fn label_intervals(task: &Task, classifier: &StageClassifier) -> Vec<LabelInterval> {
    let mut intervals: Vec<LabelInterval> = Vec::new();

    for change in time_ordered(task) {
        let Some(stage) = classifier.classify(&change.label) else {
            continue;
        };
        let label_key = change.label.to_lowercase();
        let open = intervals
            .iter()
            .rposition(|i| i.removed_at.is_none() && i.label.to_lowercase() == label_key);

        match (change.action, open) {
            // Duplicate add while attached: keep the earlier start.
            (LabelAction::Add, Some(_)) => {}
            (LabelAction::Add, None) => intervals.push(LabelInterval {
                label: change.label.clone(),
                stage,
                start: change.at,
                removed_at: None,
            }),
            (LabelAction::Remove, Some(idx)) => intervals[idx].removed_at = Some(change.at),
            (LabelAction::Remove, None) => intervals.push(LabelInterval {
                label: change.label.clone(),
                stage,
                start: task.created_at.min(change.at),
                removed_at: Some(change.at),
            }),
        }
    }

    intervals
}

/// Ordered stage entries (label additions that map to a stage).
pub fn stage_entries(task: &Task, classifier: &StageClassifier) -> Vec<StageEntry> {
    time_ordered(task)
        .into_iter()
        .filter(|c| c.action == LabelAction::Add)
        .filter_map(|c| {
            classifier.classify(&c.label).map(|stage| StageEntry {
                stage,
                at: c.at,
                actor: c.actor.clone(),
            })
        })
        .collect()
}

fn interval_end(task: &Task, interval: &LabelInterval, now: DateTime<Utc>) -> DateTime<Utc> {
    if let Some(removed_at) = interval.removed_at {
        return removed_at;
    }
    if task.is_open() && task.has_label(&interval.label) {
        now
    } else {
        task.updated_at
    }
}

fn days_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let millis = (end - start).num_milliseconds().max(0);
    millis as f64 / 86_400_000.0
}

/// Days spent in each stage as of `now`.
pub fn compute_cycle_metrics(
    task: &Task,
    classifier: &StageClassifier,
    now: DateTime<Utc>,
) -> CycleMetrics {
    let mut metrics = CycleMetrics::default();

    for interval in label_intervals(task, classifier) {
        let days = days_between(interval.start, interval_end(task, &interval, now));
        let slot = match interval.stage {
            Stage::Execution => &mut metrics.execution_days,
            Stage::Review => &mut metrics.review_days,
            Stage::FunctionalReview => &mut metrics.functional_days,
        };
        *slot = Some(slot.unwrap_or(0.0) + days);
    }

    metrics
}

/// [`compute_cycle_metrics`] against the current time.
pub fn compute_cycle_metrics_now(task: &Task, classifier: &StageClassifier) -> CycleMetrics {
    compute_cycle_metrics(task, classifier, Utc::now())
}
