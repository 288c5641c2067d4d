//! Documentation portal.
//!
//! Read-only browsing of the wikis of active projects: which projects have a
//! wiki, the page tree of one wiki and the content of one page. Pages are read
//! live from GitLab; nothing here touches the sync store.

use crate::db::pool::DbPool;
use crate::error::AppError;
use crate::models::project::{self, MonitoredProject};
use crate::services::gitlab_client::{GitLabWikiPage, RemoteSource};
use crate::services::sync_engine::{retry_transient, RetryPolicy};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;

/// Active project with a non-empty wiki.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WikiProject {
    pub id: i64,
    pub name: String,
}

/// Node of a wiki page tree. Folders come from `/` in page slugs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WikiNode {
    Folder {
        title: String,
        children: Vec<WikiNode>,
    },
    File {
        title: String,
        slug: String,
    },
}

/// One wiki page with its markdown content.
#[derive(Debug, Clone, Serialize)]
pub struct WikiPageContent {
    pub slug: String,
    pub title: String,
    pub content: String,
}

#[derive(Default)]
struct FolderBuilder {
    folders: BTreeMap<String, FolderBuilder>,
    files: Vec<(String, String)>,
}

impl FolderBuilder {
    fn insert(&mut self, page: &GitLabWikiPage) {
        let mut parts: Vec<&str> = page.slug.split('/').filter(|p| !p.is_empty()).collect();
        if parts.pop().is_none() {
            return;
        }
        let mut folder = self;
        for part in parts {
            folder = folder.folders.entry(part.to_string()).or_default();
        }
        folder.files.push((page.title.clone(), page.slug.clone()));
    }

    /// Folders first, each group ordered by title.
    fn into_nodes(self) -> Vec<WikiNode> {
        let mut nodes: Vec<WikiNode> = self
            .folders
            .into_iter()
            .map(|(title, folder)| WikiNode::Folder {
                title,
                children: folder.into_nodes(),
            })
            .collect();

        let mut files = self.files;
        files.sort();
        nodes.extend(
            files
                .into_iter()
                .map(|(title, slug)| WikiNode::File { title, slug }),
        );
        nodes
    }
}

/// Arrange flat wiki pages into a folder tree.
pub fn build_page_tree(pages: &[GitLabWikiPage]) -> Vec<WikiNode> {
    let mut root = FolderBuilder::default();
    for page in pages {
        root.insert(page);
    }
    root.into_nodes()
}

async fn active_project(pool: &DbPool, project_id: i64) -> Result<MonitoredProject, AppError> {
    match project::get_project(pool, project_id).await? {
        Some(p) if p.is_active => Ok(p),
        _ => Err(AppError::not_found_with_id("Project", project_id.to_string())),
    }
}

fn remote_not_found(err: AppError, resource: &str, id: String) -> AppError {
    match err {
        AppError::GitLabApi {
            status_code: Some(404),
            ..
        } => AppError::not_found_with_id(resource, id),
        other => other,
    }
}

/// Active projects whose wiki has at least one page.
///
/// A project whose wiki cannot be read (disabled, forbidden, unreachable) is
/// left out.
pub async fn list_wiki_projects(
    pool: &DbPool,
    remote: &dyn RemoteSource,
    retry: &RetryPolicy,
    max_concurrent: usize,
) -> Result<Vec<WikiProject>, AppError> {
    let projects = project::list_active_projects(pool).await?;

    let checked: Vec<Option<WikiProject>> = stream::iter(projects)
        .map(|p| async move {
            let what = format!("project {} wiki pages", p.id);
            match retry_transient(retry, &what, || remote.list_wiki_pages(p.id)).await {
                Ok(pages) if !pages.is_empty() => Some(WikiProject {
                    id: p.id,
                    name: p.name,
                }),
                Ok(_) => None,
                Err(e) => {
                    log::debug!("[api] No readable wiki for project {}: {}", p.id, e);
                    None
                }
            }
        })
        .buffered(max_concurrent.max(1))
        .collect()
        .await;

    Ok(checked.into_iter().flatten().collect())
}

/// Page tree of an active project's wiki.
pub async fn page_tree(
    pool: &DbPool,
    remote: &dyn RemoteSource,
    retry: &RetryPolicy,
    project_id: i64,
) -> Result<Vec<WikiNode>, AppError> {
    active_project(pool, project_id).await?;
    let what = format!("project {} wiki pages", project_id);
    let pages = retry_transient(retry, &what, || remote.list_wiki_pages(project_id))
        .await
        .map_err(|e| remote_not_found(e, "Wiki", project_id.to_string()))?;
    Ok(build_page_tree(&pages))
}

/// Content of one page of an active project's wiki.
pub async fn page_content(
    pool: &DbPool,
    remote: &dyn RemoteSource,
    retry: &RetryPolicy,
    project_id: i64,
    slug: &str,
) -> Result<WikiPageContent, AppError> {
    let slug = slug.trim_matches('/');
    if slug.is_empty() {
        return Err(AppError::invalid_input_field("Wiki page slug is required", "slug"));
    }
    active_project(pool, project_id).await?;

    let what = format!("project {} wiki page {}", project_id, slug);
    let page = retry_transient(retry, &what, || remote.get_wiki_page(project_id, slug))
        .await
        .map_err(|e| remote_not_found(e, "Wiki page", slug.to_string()))?;

    Ok(WikiPageContent {
        slug: page.slug,
        title: page.title,
        content: page.content.unwrap_or_default(),
    })
}
