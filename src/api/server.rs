//! HTTP server wiring.

use super::auth::require_admin_secret;
use super::routes::{admin_routes, query_routes};
use crate::config::Settings;
use crate::db::pool::DbPool;
use crate::services::gitlab_client::RemoteSource;
use crate::services::sync_engine::SyncHandle;
use axum::middleware;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

/// Shared state for the axum routes.
#[derive(Clone)]
pub struct ApiState {
    pub db: DbPool,
    pub sync_handle: SyncHandle,
    pub remote: Arc<dyn RemoteSource>,
    pub settings: Arc<Settings>,
}

/// Build the full router.
pub fn build_router(state: ApiState) -> Router {
    let admin = admin_routes().route_layer(middleware::from_fn_with_state(
        state.clone(),
        require_admin_secret,
    ));

    // The dashboard is served from another origin.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(query_routes())
        .merge(admin)
        .with_state(state)
        .layer(cors)
}

/// Serve `router` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("[api] Listening on http://{}", addr);
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await?;

    log::info!("[api] Server stopped");
    Ok(())
}
