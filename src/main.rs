use clap::Parser;
use gitlab_task_monitor::api::{self, ApiState};
use gitlab_task_monitor::config::Settings;
use gitlab_task_monitor::db;
use gitlab_task_monitor::models::project;
use gitlab_task_monitor::services::gitlab_client::{GitLabClient, GitLabClientConfig, RemoteSource};
use gitlab_task_monitor::services::SyncEngine;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "task-monitor")]
#[command(version)]
#[command(about = "Mirrors GitLab issues and activity and serves cycle-time and audit metrics")]
struct Cli {
    /// JSON settings file.
    #[arg(short, long, env = "TASK_MONITOR_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the settings file).
    #[arg(long)]
    listen: Option<String>,

    /// SQLite database path (overrides the settings file).
    #[arg(long)]
    database: Option<PathBuf>,

    /// Only sync on request; skip the periodic background sync.
    #[arg(long)]
    no_background_sync: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        settings.server.listen_addr = listen;
    }
    if let Some(database) = cli.database {
        settings.database_path = Some(database);
    }
    if settings.server.admin_secret.is_none() {
        log::warn!("ADMIN_SECRET is not set; registry changes are disabled");
    }

    let db_path = settings.database_path();
    let pool = db::initialize(&db_path).await?;
    log::info!("Database ready at {}", db_path.display());

    let seeded = project::seed_projects(&pool, &settings.projects).await?;
    if seeded > 0 {
        log::info!("Registered {} seed projects", seeded);
    }

    let client = GitLabClient::new(GitLabClientConfig::from_settings(
        &settings.gitlab,
        &settings.sync.issue_state,
    ))?;
    let remote: Arc<dyn RemoteSource> = Arc::new(client);

    let sync_handle = SyncEngine::start_background(
        pool.clone(),
        remote.clone(),
        settings.sync.clone(),
        !cli.no_background_sync,
    );

    let listener = tokio::net::TcpListener::bind(&settings.server.listen_addr).await?;
    let router = api::build_router(ApiState {
        db: pool,
        sync_handle: sync_handle.clone(),
        remote,
        settings: Arc::new(settings),
    });

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Shutdown requested");
        }
        signal.cancel();
    });

    api::serve(listener, router, shutdown).await?;
    sync_handle.stop().await;
    Ok(())
}
