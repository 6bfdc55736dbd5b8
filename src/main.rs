use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use volseg_worker::{
    metrics, FsObjectStore, JobOrchestrator, ModelCache, NiftiImageSource, OrtSessionFactory, Settings,
    SledJobStore, Worker,
};

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Health check endpoint
async fn health_handler() -> &'static str {
    "OK"
}

/// Prometheus metrics endpoint
async fn metrics_handler() -> String {
    metrics::export_metrics()
}

async fn serve_metrics(addr: String) -> Result<()> {
    let addr: std::net::SocketAddr = addr
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid METRICS_ADDR: {}", e))?;

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on {}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Metrics server error: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    // ONNX Runtime logs every session option at info; keep it quiet by default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info").add_directive("ort=warn".parse().unwrap())
            }),
        )
        .init();

    tracing::info!("Starting segmentation worker...");

    metrics::init_metrics();
    tracing::info!("Metrics system initialized");

    let settings = Settings::load()?;
    tracing::info!(
        "Models at {:?}, images at {:?}, objects at {:?}",
        settings.models_path,
        settings.image_root,
        settings.object_store_path
    );

    tokio::fs::create_dir_all(&settings.data_dir).await?;
    let store = Arc::new(SledJobStore::open(&settings.data_dir.join("jobs.db"))?);
    let objects = Arc::new(FsObjectStore::new(&settings.object_store_path)?);
    let images = Arc::new(NiftiImageSource::new(&settings.image_root));
    let models = Arc::new(
        ModelCache::new(Arc::new(OrtSessionFactory::new(settings.runtime.clone())))
            .with_models_root(&settings.models_path),
    );
    tracing::info!("Execution providers: {:?}", settings.runtime.providers);

    let orchestrator = Arc::new(
        JobOrchestrator::new(
            store.clone(),
            objects,
            images,
            models,
            settings.inference.clone(),
            settings.worker.cancel_check_interval,
        )
        .with_timeout(settings.worker.job_timeout),
    );

    let metrics_addr = settings.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = serve_metrics(metrics_addr).await {
            tracing::error!("{}", e);
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received, finishing current job");
        let _ = shutdown_tx.send(true);
    });

    let worker = Worker::new(orchestrator, settings.worker.poll_interval);
    worker.run(shutdown_rx).await;

    store.flush()?;
    tracing::info!("Job store flushed, exiting");
    Ok(())
}
