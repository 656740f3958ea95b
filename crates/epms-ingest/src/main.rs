//! EPMS Watcher - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use epms_common::logging::{init_logging, LogConfig, LogLevel};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use epms_ingest::{
    config::Config,
    db,
    ingest::{prepare_folders, FileProcessor, SchemaRegistry, Supervisor, UpsertEngine},
};

#[derive(Parser, Debug)]
#[command(name = "epms-watcher")]
#[command(author, version, about = "Watches inbound folders and ingests HR export CSVs")]
struct Cli {
    /// Environment file to load instead of ./.env
    #[arg(long, env = "EPMS_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// Run the startup sweep only, then exit
    #[arg(long)]
    once: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // LOG_* may live in the env file, so load it before logging starts
    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("Failed to read env file {}", path.display()))?;
        },
        None => {
            dotenvy::dotenv().ok();
        },
    }

    let mut log_config = LogConfig::from_env()?;
    if cli.verbose {
        log_config.level = LogLevel::Debug;
    }
    let _log_guard = init_logging(&log_config)?;

    info!("Starting EPMS watcher");

    let mut config = Config::load(cli.env_file.as_deref())?;
    info!(
        root = %config.folders.root.display(),
        database = %config.database.name,
        "Configuration loaded"
    );

    prepare_folders(config.folders.all()).context("Failed to create watched folders")?;
    config.folders = config.folders.resolve()?;

    // From here on a signal stops work between files instead of killing the process
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let pool = db::create_pool(&config.database).await?;

    let registry = SchemaRegistry::standard();
    db::ensure_tables(&pool, &registry).await?;

    let store = Arc::new(
        UpsertEngine::new(pool.clone()).with_chunk_size(config.pipeline.upsert_chunk_size),
    );
    let processor = Arc::new(FileProcessor::new(registry, store, &config.folders.processed));

    // Watch before sweeping so files arriving mid-sweep are not missed; a file
    // seen by both is claimed by whichever gets it first
    let mut supervisor = Supervisor::new();
    if !cli.once {
        for (folder, path) in config.folders.inbound() {
            supervisor
                .watch(folder, path, processor.clone(), config.pipeline.settle_delay())
                .with_context(|| format!("Failed to watch {}", path.display()))?;
        }
        info!(
            folders = ?supervisor.folders(),
            settle_delay_ms = config.pipeline.settle_delay_ms,
            "Watching for new files"
        );
    }

    let mut failed = 0usize;
    for (folder, path) in config.folders.inbound() {
        if shutdown.is_cancelled() {
            break;
        }
        let report = processor
            .sweep(path, folder, &shutdown)
            .await
            .with_context(|| format!("Startup sweep of {} failed", path.display()))?;
        failed += report.failed;
    }

    if cli.once {
        pool.close().await;
        if failed > 0 {
            error!(failed, "Sweep finished with failed files");
            return Ok(ExitCode::FAILURE);
        }
        info!("Sweep finished");
        return Ok(ExitCode::SUCCESS);
    }

    shutdown.cancelled().await;

    supervisor.shutdown().await?;
    pool.close().await;

    info!("Watcher shut down gracefully");

    Ok(ExitCode::SUCCESS)
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
