//! Task (issue snapshot) model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a label was attached or detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelAction {
    Add,
    Remove,
}

/// One entry of an issue's label-change timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelChange {
    pub label: String,
    pub action: LabelAction,
    pub at: DateTime<Utc>,
    /// Username of whoever made the change, when GitLab reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

/// Time tracking figures, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeStats {
    pub time_estimate: i64,
    pub total_time_spent: i64,
}

/// Cached snapshot of one GitLab issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Globally unique issue ID.
    pub task_id: i64,
    pub project_id: i64,
    /// Project-scoped issue number (`#iid`).
    pub iid: i64,
    pub title: String,
    pub description: Option<String>,
    /// `opened` or `closed`.
    pub state: String,
    pub web_url: String,
    pub author: String,
    pub assignee: Option<String>,
    pub milestone: Option<String>,
    pub labels: Vec<String>,
    pub time_stats: Option<TimeStats>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Label changes ordered by time.
    pub label_history: Vec<LabelChange>,
    /// Set by the store.
    pub first_seen_at: Option<DateTime<Utc>>,
    /// Set by the store.
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_open(&self) -> bool {
        self.state == "opened"
    }

    /// Case-insensitive check against the current label set.
    pub fn has_label(&self, label: &str) -> bool {
        labels_contain(&self.labels, label)
    }

    /// Project-scoped reference used in audit rows.
    pub fn reference(&self) -> String {
        format!("#{}", self.iid)
    }
}

/// A snapshot ready to be written, together with the raw remote payload.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task: Task,
    pub raw_data: serde_json::Value,
}

/// Days spent in each workflow stage. `None` means the stage was never entered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub execution_days: Option<f64>,
    pub review_days: Option<f64>,
    pub functional_days: Option<f64>,
}

/// A task as returned by the query surface.
#[derive(Debug, Clone, Serialize)]
pub struct TaskWithMetrics {
    #[serde(flatten)]
    pub task: Task,
    pub metrics: CycleMetrics,
}

/// Case-insensitive label membership.
pub fn labels_contain(labels: &[String], label: &str) -> bool {
    let wanted = label.to_lowercase();
    labels.iter().any(|l| l.to_lowercase() == wanted)
}
