//! GitLab API client.
//!
//! HTTP client for GitLab API v4 with token authentication and page-at-a-time
//! pagination. It knows nothing about sync policy: retries, concurrency and
//! scheduling belong to the sync engine.

use crate::config::GitLabSettings;
use crate::error::AppError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{header, Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// GitLab API client configuration.
#[derive(Debug, Clone)]
pub struct GitLabClientConfig {
    /// Base URL of the GitLab instance (e.g., `https://gitlab.com`).
    pub base_url: String,

    /// Personal access token for authentication.
    pub token: String,

    /// Request timeout in seconds.
    pub timeout_secs: u64,

    /// Page size for list endpoints.
    pub per_page: u32,

    /// Issue state filter (`opened`, `closed`, `all`).
    pub issue_state: String,
}

impl GitLabClientConfig {
    pub fn from_settings(settings: &GitLabSettings, issue_state: &str) -> Self {
        Self {
            base_url: settings.base_url.clone(),
            token: settings.token.clone(),
            timeout_secs: settings.timeout_secs,
            per_page: settings.per_page,
            issue_state: issue_state.to_string(),
        }
    }
}

/// One page of a list endpoint.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,

    /// From the `x-next-page` header; `None` on the last page.
    pub next_page: Option<u32>,
}

/// GitLab user reference as embedded in other resources.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitLabUser {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitLabMilestone {
    pub title: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitLabTimeStats {
    #[serde(default)]
    pub time_estimate: i64,
    #[serde(default)]
    pub total_time_spent: i64,
}

/// GitLab issue from API.
#[derive(Debug, Clone, Deserialize)]
pub struct GitLabIssue {
    pub id: i64,
    pub iid: i64,
    pub project_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub state: String,
    pub web_url: String,
    pub author: GitLabUser,
    #[serde(default)]
    pub assignees: Vec<GitLabUser>,
    pub assignee: Option<GitLabUser>,
    pub milestone: Option<GitLabMilestone>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub time_stats: Option<GitLabTimeStats>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl GitLabIssue {
    /// First assignee, falling back to the legacy single-assignee field.
    pub fn primary_assignee(&self) -> Option<&GitLabUser> {
        self.assignees.first().or(self.assignee.as_ref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitLabLabelRef {
    pub name: String,
}

/// Entry of an issue's `resource_label_events`.
#[derive(Debug, Clone, Deserialize)]
pub struct GitLabLabelEvent {
    pub id: i64,
    pub user: Option<GitLabUser>,
    pub created_at: DateTime<Utc>,
    /// `None` when the label has since been deleted.
    pub label: Option<GitLabLabelRef>,
    /// `add` or `remove`.
    pub action: String,
}

/// Project label from API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitLabLabel {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitLabWikiPageRef {
    pub slug: Option<String>,
    pub title: Option<String>,
}

/// Project wiki page. `content` is only present on single-page reads.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitLabWikiPage {
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitLabPushData {
    #[serde(default)]
    pub commit_count: i64,
    #[serde(rename = "ref")]
    pub ref_name: Option<String>,
}

/// Project activity-feed event.
#[derive(Debug, Clone, Deserialize)]
pub struct GitLabEvent {
    pub id: i64,
    pub project_id: Option<i64>,
    pub action_name: String,
    pub target_type: Option<String>,
    pub target_title: Option<String>,
    pub author: Option<GitLabUser>,
    pub author_username: Option<String>,
    pub created_at: DateTime<Utc>,
    pub push_data: Option<GitLabPushData>,
    pub wiki_page: Option<GitLabWikiPageRef>,
}

impl GitLabEvent {
    pub fn username(&self) -> Option<&str> {
        self.author_username
            .as_deref()
            .or_else(|| self.author.as_ref().map(|a| a.username.as_str()))
            .filter(|u| !u.is_empty())
    }

    pub fn is_wiki(&self) -> bool {
        let target = self.target_type.as_deref().unwrap_or_default();
        target.to_lowercase().contains("wiki") || self.action_name.to_lowercase().contains("wiki")
    }

    pub fn is_push(&self) -> bool {
        self.action_name.to_lowercase().contains("pushed")
    }
}

/// The remote operations the sync engine depends on.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// One page of a project's issues, as raw JSON so malformed entries can be skipped.
    async fn list_issues_page(
        &self,
        project_id: i64,
        page: u32,
    ) -> Result<Page<serde_json::Value>, AppError>;

    /// The full label-change history of an issue.
    async fn list_label_events(
        &self,
        project_id: i64,
        issue_iid: i64,
    ) -> Result<Vec<GitLabLabelEvent>, AppError>;

    /// One page of a project's activity feed strictly between `after` and `before`.
    async fn list_events_page(
        &self,
        project_id: i64,
        after: NaiveDate,
        before: NaiveDate,
        page: u32,
    ) -> Result<Page<serde_json::Value>, AppError>;

    /// All labels defined on a project.
    async fn list_labels(&self, project_id: i64) -> Result<Vec<GitLabLabel>, AppError>;

    /// Every wiki page of a project, without content.
    async fn list_wiki_pages(&self, project_id: i64) -> Result<Vec<GitLabWikiPage>, AppError>;

    /// One wiki page with its content. `slug` may contain `/`.
    async fn get_wiki_page(&self, project_id: i64, slug: &str) -> Result<GitLabWikiPage, AppError>;
}

/// GitLab API client.
#[derive(Debug, Clone)]
pub struct GitLabClient {
    client: Client,
    config: GitLabClientConfig,
}

impl GitLabClient {
    /// Create a new GitLab client.
    pub fn new(config: GitLabClientConfig) -> Result<Self, AppError> {
        if config.base_url.trim().is_empty() {
            return Err(AppError::invalid_input_field(
                "GitLab URL is required",
                "gitlab.base_url",
            ));
        }

        let mut headers = header::HeaderMap::new();
        let token_value = header::HeaderValue::from_str(&config.token)
            .map_err(|_| AppError::authentication("Invalid token format"))?;
        headers.insert("PRIVATE-TOKEN", token_value);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/api/v4{}",
            self.config.base_url.trim_end_matches('/'),
            path
        )
    }

    fn next_page(response: &Response) -> Option<u32> {
        response
            .headers()
            .get("x-next-page")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok())
    }

    /// Map a non-success response to an error, keeping GitLab's message when present.
    async fn error_from_response(response: Response, endpoint: &str) -> AppError {
        let status = response.status();
        let status_code = status.as_u16();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            );
            return AppError::rate_limited(endpoint, retry_after);
        }

        let body = response.text().await.unwrap_or_default();
        let body_message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                // GitLab returns {"message": "..."} or {"error": "..."}
                v.get("message").or_else(|| v.get("error")).map(|m| match m.as_str() {
                    Some(s) => s.to_string(),
                    None => m.to_string(),
                })
            });

        let message = match (status, body_message) {
            (StatusCode::UNAUTHORIZED, _) => "GitLab token rejected".to_string(),
            (StatusCode::FORBIDDEN, _) => "Access denied".to_string(),
            (StatusCode::NOT_FOUND, _) => "Resource not found".to_string(),
            (_, Some(msg)) => msg,
            _ => format!("Request failed ({}): {}", status_code, body),
        };

        AppError::gitlab_api_full(message, status_code, endpoint)
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
        page: u32,
    ) -> Result<Page<T>, AppError> {
        let response = self
            .client
            .get(self.api_url(endpoint))
            .query(query)
            .query(&[
                ("page", page.to_string()),
                ("per_page", self.config.per_page.to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response, endpoint).await);
        }

        let next_page = Self::next_page(&response);
        let items = response
            .json::<Vec<T>>()
            .await
            .map_err(|e| AppError::data_shape(format!("{}: {}", endpoint, e)))?;

        Ok(Page { items, next_page })
    }

    async fn get_all_pages<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, AppError> {
        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let batch = self.get_page::<T>(endpoint, query, page).await?;
            all.extend(batch.items);
            match batch.next_page {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }
        Ok(all)
    }
}

#[async_trait]
impl RemoteSource for GitLabClient {
    async fn list_issues_page(
        &self,
        project_id: i64,
        page: u32,
    ) -> Result<Page<serde_json::Value>, AppError> {
        let endpoint = format!("/projects/{}/issues", project_id);
        let query = [
            ("state", self.config.issue_state.clone()),
            ("order_by", "updated_at".to_string()),
            ("sort", "desc".to_string()),
        ];
        self.get_page(&endpoint, &query, page).await
    }

    async fn list_label_events(
        &self,
        project_id: i64,
        issue_iid: i64,
    ) -> Result<Vec<GitLabLabelEvent>, AppError> {
        let endpoint = format!(
            "/projects/{}/issues/{}/resource_label_events",
            project_id, issue_iid
        );
        self.get_all_pages(&endpoint, &[]).await
    }

    async fn list_events_page(
        &self,
        project_id: i64,
        after: NaiveDate,
        before: NaiveDate,
        page: u32,
    ) -> Result<Page<serde_json::Value>, AppError> {
        let endpoint = format!("/projects/{}/events", project_id);
        let query = [
            ("after", after.format("%Y-%m-%d").to_string()),
            ("before", before.format("%Y-%m-%d").to_string()),
            ("sort", "asc".to_string()),
        ];
        self.get_page(&endpoint, &query, page).await
    }

    async fn list_labels(&self, project_id: i64) -> Result<Vec<GitLabLabel>, AppError> {
        let endpoint = format!("/projects/{}/labels", project_id);
        self.get_all_pages(&endpoint, &[]).await
    }

    async fn list_wiki_pages(&self, project_id: i64) -> Result<Vec<GitLabWikiPage>, AppError> {
        let endpoint = format!("/projects/{}/wikis", project_id);
        let response = self.client.get(self.api_url(&endpoint)).send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from_response(response, &endpoint).await);
        }
        response
            .json::<Vec<GitLabWikiPage>>()
            .await
            .map_err(|e| AppError::data_shape(format!("{}: {}", endpoint, e)))
    }

    async fn get_wiki_page(&self, project_id: i64, slug: &str) -> Result<GitLabWikiPage, AppError> {
        // Nested slugs contain '/', which GitLab expects encoded.
        let endpoint = format!(
            "/projects/{}/wikis/{}",
            project_id,
            urlencoding::encode(slug)
        );
        let response = self.client.get(self.api_url(&endpoint)).send().await?;
        if !response.status().is_success() {
            return Err(Self::error_from_response(response, &endpoint).await);
        }
        response
            .json::<GitLabWikiPage>()
            .await
            .map_err(|e| AppError::data_shape(format!("{}: {}", endpoint, e)))
    }
}

/// Parse a `Retry-After` header given in delta-seconds.
///
/// HTTP-date values are ignored; the caller falls back to its own backoff.
pub fn parse_retry_after(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.trim().parse::<u64>().ok())
}
