mod catalog;
mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use retrotv_core::resolver::ProgramPoolResolver;
use retrotv_core::scheduler::ScheduleWorkerPool;
use retrotv_core::store::{ChannelRepository, JsonChannelRepository, LineupStore};
use retrotv_core::{logging, Config};
use retrotv_stream::ffmpeg::FfmpegSpawner;
use retrotv_stream::ondemand::OnDemandController;
use retrotv_stream::SessionManager;

use catalog::JsonCatalog;
use server::{create_router, AppState};

#[derive(Debug, Parser)]
#[command(name = "retrotv", version, about = "Virtual broadcast TV channels from a media library")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "RETROTV_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    logging::init_logging(&config.logging)?;
    info!("retrotv starting");

    tokio::fs::create_dir_all(&config.storage.data_dir)
        .await
        .context("creating data directory")?;
    tokio::fs::create_dir_all(&config.streaming.session_dir)
        .await
        .context("creating session directory")?;

    let channels: Arc<dyn ChannelRepository> =
        Arc::new(JsonChannelRepository::new(&config.storage.data_dir));
    let lineups = Arc::new(LineupStore::new(
        &config.storage.data_dir,
        config.storage.max_repair_passes,
    ));
    let ondemand = Arc::new(OnDemandController::new(lineups.clone()));
    let resolver: Arc<dyn ProgramPoolResolver> =
        Arc::new(JsonCatalog::load(&config.storage.data_dir).await?);
    let workers = Arc::new(ScheduleWorkerPool::new(config.scheduler.worker_threads));
    let sessions = Arc::new(SessionManager::new(
        channels.clone(),
        lineups.clone(),
        ondemand.clone(),
        Arc::new(FfmpegSpawner),
        config.streaming.clone(),
    ));

    let cancel = sessions.cancellation_token();
    let reaper = sessions.spawn_reaper();
    let checkpoints = ondemand.spawn_checkpoint_task(
        Duration::from_secs(config.streaming.cursor_checkpoint_seconds),
        cancel.clone(),
    );

    let addr = format!("{}:{}", config.server.host, config.server.http_port);
    let state = AppState {
        config: Arc::new(config),
        channels,
        lineups,
        resolver,
        workers,
        sessions: sessions.clone(),
        build_locks: Arc::new(dashmap::DashMap::new()),
    };
    let router = create_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "http server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    info!("shutting down");
    cancel.cancel();
    sessions.stop_all().await;
    if let Err(e) = checkpoints.await {
        error!("checkpoint task join failed: {e}");
    }
    if let Err(e) = reaper.await {
        error!("reaper task join failed: {e}");
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("ctrl-c handler failed: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("sigterm handler failed: {e}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received sigterm"),
    }
}
