use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use engine::crawler::Crawler;
use engine::fetcher::http::ReqwestFetcher;
use engine::job_manager::JobManager;
use engine::quota::QuotaService;
use engine::queue::TaskQueue;
use engine::reaper::Reaper;
use engine::scheduler::SchedulerLoop;
use engine::seed_loader::SeedLoader;
use engine::storage::postgres::PostgresStore;
use engine::storage::EngineStore;
use engine::worker::{WorkerPool, WorkerPoolConfig};

use server_core::config::Config;
use server_core::{build_app, AppState};

/// Process entry point. Grounded on the teacher's `server/main.rs`: init
/// tracing, load config, connect the pool, run migrations, build the app,
/// serve — extended with the background loops (Worker Pool, Scheduler Loop,
/// Reaper) the teacher's simpler GraphQL service has no equivalent for,
/// grounded instead on `kernel::jobs::worker`'s "spawn, then serve" ordering.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!(
        app_env = ?config.engine.app_env,
        global_workers = config.engine.global_workers,
        "starting cache-warming engine",
    );

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.engine.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("../../migrations").run(&pool).await.context("failed to run migrations")?;

    let store: Arc<dyn EngineStore> = Arc::new(PostgresStore::new(pool));
    let queue = TaskQueue::new(store.clone());
    let quota = QuotaService::new(store.clone());
    let fetcher = Arc::new(ReqwestFetcher::new());
    let seed_loader = SeedLoader::new(fetcher.clone(), queue.clone(), Default::default());
    let job_manager = Arc::new(JobManager::new(store.clone(), queue.clone(), quota.clone(), seed_loader));

    let reaper = Reaper::new(store.clone(), queue.clone(), job_manager.clone());
    reaper.recover_on_startup().await.context("startup recovery failed")?;

    let shutdown = CancellationToken::new();

    let crawler = Arc::new(Crawler::new(fetcher));
    let worker_pool_config = WorkerPoolConfig {
        global_workers: config.engine.global_workers,
        probe_timeout: std::time::Duration::from_secs(config.engine.probe_timeout_secs),
        default_domain_concurrency: config.engine.default_domain_concurrency,
        ..Default::default()
    };
    let worker_pool = WorkerPool::new(store.clone(), queue.clone(), job_manager.clone(), quota, crawler, worker_pool_config);
    let scheduler_loop = SchedulerLoop::new(store.clone(), job_manager.clone());

    let worker_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker_pool.run(shutdown).await }
    });
    let scheduler_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { scheduler_loop.run(shutdown).await }
    });
    let reaper_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { reaper.run(shutdown).await }
    });

    let state = AppState { job_manager, store, config: Arc::new(config.clone()) };
    let app = build_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind listener")?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("server error")?;

    shutdown.cancel();
    let _ = tokio::join!(worker_handle, scheduler_handle, reaper_handle);

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    shutdown.cancel();
}
