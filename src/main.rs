use anyhow::Result;
use cropscan_node::{
    api, config::Config, metrics, BackendLoader, DiagnosisMapper, InferenceExecutor,
    OnnxBackendProvider, ScanSessions, Taxonomy,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // ONNX Runtime logs every graph optimization pass at info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,ort=warn")),
        )
        .init();

    tracing::info!("Starting crop scan node...");

    metrics::init_metrics();
    tracing::info!("Metrics system initialized");

    let config = Config::load()?;

    let taxonomy = match &config.taxonomy_path {
        Some(path) => {
            let taxonomy = Taxonomy::load(path)?;
            tracing::info!(path = %path.display(), entries = taxonomy.len(), "Loaded taxonomy");
            Arc::new(taxonomy)
        }
        None => Taxonomy::builtin(),
    };

    let model_config = &config.model_config;
    let provider = Arc::new(OnnxBackendProvider::from_config(model_config));
    let loader = Arc::new(BackendLoader::new(
        model_config.model_id.clone(),
        model_config.device_priority.clone(),
        provider,
    ));
    tracing::info!(
        model = %model_config.model_id,
        devices = ?model_config.device_priority,
        "Backend loader configured"
    );

    let scan_config = &config.scan_config;
    let sessions = Arc::new(ScanSessions::new(
        Arc::clone(&loader),
        InferenceExecutor::from_millis(scan_config.inference_timeout_ms),
        DiagnosisMapper::new(taxonomy, scan_config.confidence_threshold),
        scan_config.max_image_bytes,
    ));

    if config.preload_model {
        // Scans submitted meanwhile join this load
        let loader = Arc::clone(&loader);
        tokio::spawn(async move {
            match loader.ensure_ready().await {
                Ok(backend) => tracing::info!(device = %backend.device(), "Backend preloaded"),
                Err(e) => tracing::warn!(error = %e, "Backend preload failed, will retry on first scan"),
            }
        });
    }

    let app = api::create_router(sessions);
    let addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Scan API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("API server error: {}", e))?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
