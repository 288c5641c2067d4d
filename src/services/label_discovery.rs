//! Stage-label discovery.
//!
//! Scans the labels defined on every active project and reports which label
//! names the keyword table maps to each workflow stage. Useful when a team
//! introduces a new spelling and the dashboard stops counting it.

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::project;
use crate::services::cycle_time::{Stage, StageClassifier};
use crate::services::gitlab_client::RemoteSource;
use crate::services::sync_engine::{retry_transient, RetryPolicy};
use serde::Serialize;
use std::collections::BTreeSet;

/// Label names grouped by the stage they classify as.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageLabelReport {
    pub execution: BTreeSet<String>,
    pub review: BTreeSet<String>,
    pub functional_review: BTreeSet<String>,

    /// Projects whose labels were read.
    pub scanned_projects: usize,

    /// Projects whose labels could not be fetched, with the reason.
    pub failed_projects: Vec<String>,
}

impl StageLabelReport {
    fn insert(&mut self, stage: Stage, label: String) {
        let bucket = match stage {
            Stage::Execution => &mut self.execution,
            Stage::Review => &mut self.review,
            Stage::FunctionalReview => &mut self.functional_review,
        };
        bucket.insert(label);
    }
}

/// Classify every label of every active project.
///
/// A project whose labels cannot be fetched is reported and skipped.
pub async fn discover_stage_labels(
    pool: &DbPool,
    remote: &dyn RemoteSource,
    classifier: &StageClassifier,
    retry: &RetryPolicy,
) -> Result<StageLabelReport, AppError> {
    let projects = project::list_active_projects(pool).await?;
    let mut report = StageLabelReport::default();

    for p in projects {
        let what = format!("project {} labels", p.id);
        let labels = match retry_transient(retry, &what, || remote.list_labels(p.id)).await {
            Ok(labels) => labels,
            Err(e) => {
                log::warn!("[sync] Label discovery skipped project {}: {}", p.id, e);
                report
                    .failed_projects
                    .push(format!("{} ({}): {}", p.name, p.id, e));
                continue;
            }
        };

        report.scanned_projects += 1;
        for label in labels {
            if let Some(stage) = classifier.classify(&label.name) {
                report.insert(stage, label.name);
            }
        }
    }

    log::info!(
        "[sync] Label discovery: {} projects, {} execution, {} review, {} functional labels",
        report.scanned_projects,
        report.execution.len(),
        report.review.len(),
        report.functional_review.len()
    );
    Ok(report)
}
