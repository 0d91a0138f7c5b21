//! UNet Loader - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use unet_loader::{
    ArtifactStore, CheckpointRegistry, HostSignals, MemoryHost, MergePipeline, Precision, api,
    config::LoaderConfig, gpu, metrics,
};

#[derive(Parser, Debug)]
#[command(name = "unet-loader")]
#[command(about = "Combine UNet and non-UNet checkpoints and hot-swap the result", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override API port
    #[arg(long)]
    port: Option<u16>,

    /// Override models directory
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting UNet Loader");

    // Load configuration
    let mut config = LoaderConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.api_port = port;
    }
    if let Some(models_dir) = cli.models_dir {
        config.models_dir = models_dir;
    }

    config.validate()?;

    tracing::info!(
        api_port = config.api_port,
        models_dir = ?config.models_dir,
        cache_capacity = config.cache_capacity,
        half_precision = config.half_precision,
        "Configuration loaded"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    // Pick the serving device
    let gpu_info = gpu::get_or_init();
    let device = gpu_info.preferred_device();
    let device_capacity = config
        .device_memory_bytes
        .or_else(|| gpu_info.memory_of(device));

    tracing::info!(
        device = %device,
        device_capacity = ?device_capacity,
        "Using compute device"
    );

    let precision = if config.half_precision {
        Precision::Half
    } else {
        Precision::Full
    };

    let pipeline = Arc::new(MergePipeline::new(
        ArtifactStore::new(&config.models_dir, &config.artifact_suffix),
        Arc::new(MemoryHost::new(device, device_capacity)),
        Arc::new(HostSignals::new()),
        Arc::new(CheckpointRegistry::new()),
        config.cache_capacity,
        precision,
    ));

    tracing::info!(
        artifacts = pipeline.list_available_artifacts().len(),
        "Artifact store ready"
    );

    // Setup API
    let app_state = api::AppState {
        pipeline: pipeline.clone(),
        prometheus_handle,
    };

    let app = api::create_router(app_state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind API server")?;

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    tracing::info!("Shutting down...");

    if let Some(path) = pipeline.last_merged().await {
        tracing::info!(path = ?path, "Combined model left on disk");
    }

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
