//! Application settings.
//!
//! Settings are read from an optional JSON file; every field has a default so
//! a partial (or missing) file is valid. A handful of environment variables
//! override the file, and secrets are only ever taken from the environment.

use crate::error::AppError;
use crate::services::cycle_time::{Stage, StageClassifier};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default sync interval in seconds (10 minutes).
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 600;

/// Default label counted as "waiting for review" on the dashboard.
pub const DEFAULT_REVIEW_LABEL: &str = "PARA REVISIÓN";

/// Connection settings for the GitLab instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitLabSettings {
    /// Base URL of the GitLab instance (e.g., `https://gitlab.example.com`).
    pub base_url: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,

    /// Page size for list endpoints (GitLab caps this at 100).
    pub per_page: u32,

    /// Personal access token. Never read from the settings file.
    #[serde(skip)]
    pub token: String,
}

impl Default for GitLabSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_secs: 30,
            per_page: 100,
            token: String::new(),
        }
    }
}

/// Sync orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Periodic sync interval in seconds; 0 disables the periodic sync.
    pub interval_secs: u64,

    /// Retries per page after the first attempt.
    pub max_retries: u32,

    /// First backoff delay; doubles on every retry.
    pub initial_backoff_ms: u64,

    /// Upper bound for a single backoff delay.
    pub max_backoff_ms: u64,

    /// How many projects may be fetched at the same time.
    pub max_concurrent_projects: usize,

    /// Label used for the per-project review counter.
    pub review_label: String,

    /// Issue state filter passed to GitLab (`opened`, `closed`, `all`).
    pub issue_state: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            max_concurrent_projects: 4,
            review_label: DEFAULT_REVIEW_LABEL.to_string(),
            issue_state: "all".to_string(),
        }
    }
}

/// Keyword table mapping label names to workflow stages.
///
/// Matching is case-insensitive substring matching, checked in the order
/// functional review, review, execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageKeywords {
    pub functional_review: Vec<String>,
    pub review: Vec<String>,
    pub execution: Vec<String>,
}

impl Default for StageKeywords {
    fn default() -> Self {
        let owned = |words: &[&str]| words.iter().map(|w| w.to_string()).collect();
        Self {
            functional_review: owned(&["funcional", "functional"]),
            review: owned(&["revisión", "revision", "review"]),
            execution: owned(&["ejecución", "ejecucion", "execution"]),
        }
    }
}

impl StageKeywords {
    /// Build the classifier used by the cycle-time and audit computations.
    pub fn classifier(&self) -> StageClassifier {
        StageClassifier::new(vec![
            (Stage::FunctionalReview, self.functional_review.clone()),
            (Stage::Review, self.review.clone()),
            (Stage::Execution, self.execution.clone()),
        ])
    }
}

/// Audit aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Usernames that get a summary row. Empty means "everyone observed".
    pub tracked_users: Vec<String>,

    /// A review is on time when it happens within this many days of the raise.
    pub review_sla_days: i64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            tracked_users: Vec::new(),
            review_sla_days: 3,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,

    /// Shared secret for the registry screen. Never read from the settings file.
    #[serde(skip)]
    pub admin_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8001".to_string(),
            admin_secret: None,
        }
    }
}

/// A project registered at startup if not already known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedProject {
    pub id: i64,
    pub name: String,
}

/// Application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub gitlab: GitLabSettings,
    pub sync: SyncConfig,
    pub stages: StageKeywords,
    pub audit: AuditConfig,
    pub server: ServerConfig,
    pub database_path: Option<PathBuf>,
    pub projects: Vec<SeedProject>,
}

impl Settings {
    /// Load settings from a JSON file, falling back to defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let mut settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    AppError::internal(format!(
                        "Failed to read settings file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Self::from_json(&raw)?
            }
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from JSON text.
    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        serde_json::from_str(raw)
            .map_err(|e| AppError::invalid_input(format!("Invalid settings file: {}", e)))
    }

    /// Apply environment overrides through a lookup function.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("GITLAB_URL") {
            self.gitlab.base_url = url;
        }
        if let Some(token) = lookup("GITLAB_TOKEN") {
            self.gitlab.token = token;
        }
        if let Some(secret) = lookup("ADMIN_SECRET").filter(|s| !s.is_empty()) {
            self.server.admin_secret = Some(secret);
        }
        if let Some(interval) = lookup("SYNC_INTERVAL_SECONDS").and_then(|v| v.parse().ok()) {
            self.sync.interval_secs = interval;
        }
        if let Some(path) = lookup("DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(addr) = lookup("LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
    }

    /// Reject settings that would make the orchestrator misbehave.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.sync.max_concurrent_projects == 0 {
            return Err(AppError::invalid_input_field(
                "must be at least 1",
                "sync.max_concurrent_projects",
            ));
        }
        if self.gitlab.per_page == 0 || self.gitlab.per_page > 100 {
            return Err(AppError::invalid_input_field(
                "must be between 1 and 100",
                "gitlab.per_page",
            ));
        }
        if self.audit.review_sla_days < 0 {
            return Err(AppError::invalid_input_field(
                "must not be negative",
                "audit.review_sla_days",
            ));
        }
        Ok(())
    }

    /// Database file location.
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("task-monitor.db"))
    }
}
