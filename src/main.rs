//! Facial Emotion Detection Service
//!
//! REST service for emotion detection with OpenVINO acceleration, batch
//! scheduling and background result completion.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;

use emoface::api::rest::{create_rest_router, AppState};
use emoface::config::Config;
use emoface::engine::backend::{build_resources, ModelPool};
use emoface::engine::{ModelResources, ModelStatus};
use emoface::service::{BackgroundExecutor, BatchScheduler, DetectionService, NotificationBoard, PipelineTimeouts};
use emoface::storage::{DetectionStore, LocalUploader, MemoryStorage, SqliteStorage};
use emoface::utils::logging::log_filter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging, RUST_LOG overrides the default level
    FmtSubscriber::builder()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .with_target(false)
        .init();

    info!("Starting Emotion Detection Service v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&Config::default_path()).unwrap_or_else(|e| {
        info!("Using default config ({})", e);
        Config::default()
    });

    info!("Configuration loaded:");
    info!("  REST port: {}", config.server.rest_port);
    info!("  Device: {}", config.inference.device);
    info!("  Max batch size: {}", config.detection.max_batch_size);
    info!("  Storage: {}", config.storage.storage_type);

    // Initialize model pool
    let pool = Arc::new(ModelPool::new(
        &config.inference,
        &config.models.detector,
        &config.models.emotion,
    )?);
    if let Err(e) = pool.warm_up() {
        warn!("Model warm-up failed, models will load on first request: {:#}", e);
    }

    let pool_clone = pool.clone();
    tokio::spawn(async move {
        pool_clone.start_cleanup_task().await;
    });

    let resources = Arc::new(build_resources(pool.clone(), &config));

    match config.storage.storage_type.as_str() {
        "memory" => {
            info!("Using in-memory storage");
            serve(Arc::new(MemoryStorage::new()), resources, pool.clone(), &config).await?;
        }
        _ => {
            let path = config
                .storage
                .sqlite_path
                .clone()
                .unwrap_or_else(|| "data/detections.db".into());
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let path_str = path.to_str().context("SQLite path is not valid UTF-8")?;

            let storage = Arc::new(SqliteStorage::new(path_str).await?);
            info!("SQLite storage initialized at: {}", path_str);
            serve(storage, resources, pool.clone(), &config).await?;
        }
    }

    pool.shutdown();

    info!("Goodbye!");
    Ok(())
}

/// Build the service graph over `storage` and serve REST until ctrl-c
async fn serve<S: DetectionStore>(
    storage: Arc<S>,
    resources: Arc<ModelResources>,
    pool: Arc<ModelPool>,
    config: &Config,
) -> Result<()> {
    let notifications = Arc::new(NotificationBoard::new(Duration::from_secs(
        config.background.notification_ttl_secs,
    )));

    std::fs::create_dir_all(Path::new(&config.upload.dir))?;
    let uploader = Arc::new(LocalUploader::from_config(&config.upload));

    let service = Arc::new(DetectionService::new(
        resources,
        storage,
        uploader,
        notifications.clone(),
        PipelineTimeouts::from_config(config),
    ));
    let batch = BatchScheduler::new(service.clone(), config.detection.max_batch_size);

    let (executor, executor_handle) =
        BackgroundExecutor::start(config.background.queue_capacity, config.background.max_concurrent);

    let app_state = Arc::new(AppState {
        service,
        batch,
        executor,
        notifications,
        model_status: Some(pool as Arc<dyn ModelStatus>),
    });
    let router = create_rest_router(app_state, config);

    let addr = format!("0.0.0.0:{}", config.server.rest_port);
    let listener = TcpListener::bind(&addr).await?;
    info!("REST API listening on http://{}", addr);
    info!("Emotion Detection Service is ready!");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received, cleaning up...");
        })
        .await?;

    // Router dropped: the executor drains queued tasks and exits
    if tokio::time::timeout(Duration::from_secs(10), executor_handle).await.is_err() {
        warn!("Background tasks still running at shutdown");
    }

    Ok(())
}
