//! GitLab task monitor.
//!
//! Mirrors GitLab issues, wiki edits and pushes of the monitored projects
//! into a local SQLite store, and derives per-issue cycle times and monthly
//! per-user audit reports from it. The `task-monitor` binary serves the
//! results over HTTP.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

pub use config::Settings;
pub use error::AppError;
