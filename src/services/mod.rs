//! Business logic services.
//!
//! The GitLab client and the sync engine move data into the store; the
//! cycle-time and audit computations are pure functions over what is stored.
//! The wiki portal reads GitLab directly.

pub mod audit;
pub mod cycle_time;
pub mod doc_classifier;
pub mod gitlab_client;
pub mod label_discovery;
pub mod sync_engine;
pub mod wiki_portal;

pub use gitlab_client::{GitLabClient, RemoteSource};
pub use sync_engine::{SyncEngine, SyncHandle};
