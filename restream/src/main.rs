use std::sync::Arc;

use restream::api::{ApiServer, ApiServerConfig, AppState};
use restream::config::AppConfig;
use restream::database::{self, repositories::SqlxStreamRepository};
use restream::launcher::FfmpegLauncher;
use restream::logging;
use restream::scheduler::{Scheduler, SchedulerConfig};
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    let (logging_config, _log_guard) = logging::init_logging(&config.log_dir)?;

    let background_cancel = CancellationToken::new();
    logging_config.start_retention_cleanup(background_cancel.clone());

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;
    let repo = Arc::new(SqlxStreamRepository::new(pool.clone()));

    let launcher = FfmpegLauncher::with_config(config.ffmpeg.clone());
    match launcher.version() {
        Some(version) => tracing::info!(version = %version, "ffmpeg detected"),
        None => tracing::warn!(
            path = %launcher.config().binary_path,
            "ffmpeg not found; stream starts will fail until it is installed"
        ),
    }

    let scheduler = Scheduler::new(
        SchedulerConfig {
            max_concurrent: config.max_concurrent_streams,
            shutdown_timeout: config.shutdown_timeout,
        },
        repo.clone(),
        Arc::new(launcher),
    );

    let reset = scheduler.reconcile_persisted_status().await?;
    if reset > 0 {
        tracing::info!(count = reset, "Reset streams left active by a previous run");
    }

    let state = AppState::new(scheduler.clone(), repo).with_logging_config(logging_config);
    let server = ApiServer::new(ApiServerConfig::from(&config), state);

    let server_cancel = server.cancel_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl-C, shutting down"),
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
        server_cancel.cancel();
    });

    tracing::info!(
        max_concurrent = config.max_concurrent_streams,
        "restream initialized successfully"
    );

    let served = server.run().await;

    let report = scheduler.shutdown().await;
    tracing::info!(
        terminated = report.terminated,
        dropped_queued = report.dropped_queued,
        remaining = report.remaining,
        "Scheduler stopped"
    );

    background_cancel.cancel();
    pool.close().await;

    served?;
    Ok(())
}
