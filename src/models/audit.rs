//! Audit rows derived per calendar month.
//!
//! Nothing here is persisted; reports are recomputed on every request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classified audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEventType {
    IssueRaised,
    IssueReviewed,
    /// Detail-view merge of a raise and a review of the same issue by the same user.
    IssueRaisedReviewed,
    IssueBounced,
    DocCreated,
    DocUpdated,
    ManualCreated,
    ManualUpdated,
    Push,
}

/// One detail row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub username: String,
    pub project_id: i64,
    pub project_name: String,
    pub event_type: AuditEventType,
    /// Issue reference (`#12`), wiki slug, or push event ID.
    pub reference_id: String,
    pub event_date: DateTime<Utc>,
    /// Review rows only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_time: Option<bool>,
    /// Bounce rows only: 1-based occurrence per issue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u32>,
}

/// Per-user counts for one month.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub username: String,
    pub month: u32,
    pub year: i32,
    pub issues_raised: u32,
    pub issues_reviewed: u32,
    pub issues_reviewed_on_time: u32,
    pub issues_bounced: u32,
    pub docs_created: u32,
    pub docs_updated: u32,
    pub manuals_created: u32,
    pub manuals_updated: u32,
    pub pushes: u32,
    /// `None` when nothing was reviewed.
    pub on_time_ratio: Option<f64>,
}

impl AuditSummary {
    pub fn empty(username: impl Into<String>, month: u32, year: i32) -> Self {
        Self {
            username: username.into(),
            month,
            year,
            ..Default::default()
        }
    }

    /// Count one event of the given type.
    pub fn record(&mut self, event: &AuditEvent) {
        match event.event_type {
            AuditEventType::IssueRaised => self.issues_raised += 1,
            AuditEventType::IssueReviewed => {
                self.issues_reviewed += 1;
                if event.on_time == Some(true) {
                    self.issues_reviewed_on_time += 1;
                }
            }
            AuditEventType::IssueRaisedReviewed => {}
            AuditEventType::IssueBounced => self.issues_bounced += 1,
            AuditEventType::DocCreated => self.docs_created += 1,
            AuditEventType::DocUpdated => self.docs_updated += 1,
            AuditEventType::ManualCreated => self.manuals_created += 1,
            AuditEventType::ManualUpdated => self.manuals_updated += 1,
            AuditEventType::Push => self.pushes += 1,
        }
        self.on_time_ratio = (self.issues_reviewed > 0)
            .then(|| self.issues_reviewed_on_time as f64 / self.issues_reviewed as f64);
    }
}

/// Result of one audit computation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub summaries: Vec<AuditSummary>,
    pub details: Vec<AuditEvent>,
}
