//! Wiki and push events taken from a project's activity feed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which kind of activity an event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Wiki,
    Push,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wiki => "wiki",
            Self::Push => "push",
        }
    }
}

impl std::str::FromStr for ActivityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wiki" => Ok(Self::Wiki),
            "push" => Ok(Self::Push),
            other => Err(format!("unknown activity kind: {}", other)),
        }
    }
}

/// One stored activity event. Identity is `(project_id, event_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub project_id: i64,
    pub event_id: i64,
    pub kind: ActivityKind,
    /// GitLab action name (`created`, `updated`, `pushed to`, ...).
    pub action_name: String,
    pub username: String,
    /// Wiki page title.
    pub target_title: Option<String>,
    /// Wiki page slug.
    pub wiki_slug: Option<String>,
    /// Branch or tag of a push.
    pub ref_name: Option<String>,
    pub commit_count: Option<i64>,
    pub created_at: DateTime<Utc>,
}
