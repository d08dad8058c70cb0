//! snapkeeper - scheduled database snapshot backups
//!
//! Loads settings, builds the storage session once, and runs backup cycles
//! on a fixed interval until SIGINT/SIGTERM.

mod args;
mod exit_code;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sk_core::config::format_duration;
use sk_core::{
    BackupSettings, IncrementalBackup, Orchestrator, RetentionSweeper, Scheduler, SettingsBuilder,
};
use sk_s3::{S3Client, SnapshotClient, StorageViews};
use tokio_util::sync::CancellationToken;

use crate::args::Cli;
use crate::exit_code::ExitCode;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level().into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::Success.into(),
        Err(e) => {
            let message = format!("{e:#}");
            tracing::error!(error = %message, "snapkeeper failed");
            ExitCode::from_error(&e).into()
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Arc::new(load_settings(&cli)?);
    tracing::info!(
        destination = %settings.destination,
        origin = %settings
            .origin
            .as_ref()
            .map_or_else(|| "none".to_string(), ToString::to_string),
        concurrency = settings.concurrency.get(),
        max_bytes_per_second = settings.max_bytes_per_second,
        retention = %format_duration(settings.retention.window),
        interval = %format_duration(settings.interval),
        "Loaded settings"
    );

    let s3 = if uses_object_storage(&settings) {
        let client = S3Client::new(&settings.storage)
            .await
            .context("cannot set up object-storage session")?;
        Some(Arc::new(client))
    } else {
        None
    };

    let snapshots = SnapshotClient::new()?;
    let views = StorageViews::new(s3.clone());
    let mut orchestrator = Orchestrator::new(
        settings.clone(),
        Arc::new(snapshots),
        Arc::new(views),
        Arc::new(IncrementalBackup),
    );
    if let Some(client) = s3.filter(|_| settings.destination.is_object_storage()) {
        orchestrator = orchestrator.with_sweeper(RetentionSweeper::new(client, settings.retention));
    } else {
        tracing::info!("Destination is not object storage, retention sweep disabled");
    }

    let scheduler = Scheduler::from_settings(Arc::new(orchestrator));
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Received shutdown signal");
            shutdown.cancel();
        }
    });

    scheduler.run(shutdown).await;
    Ok(())
}

/// Config file layer overlaid with flags and environment
fn load_settings(cli: &Cli) -> sk_core::Result<BackupSettings> {
    let file_layer = match config_path(cli) {
        Some(path) => {
            tracing::debug!(path = %path.display(), "Reading config file");
            SettingsBuilder::load(&path)?
        }
        None => SettingsBuilder::new(),
    };
    file_layer.overlay(cli.settings_layer()).build()
}

fn config_path(cli: &Cli) -> Option<PathBuf> {
    cli.config.clone().or_else(|| {
        dirs::config_dir()
            .map(|dir| dir.join("snapkeeper").join("config.toml"))
            .filter(|path| path.is_file())
    })
}

fn uses_object_storage(settings: &BackupSettings) -> bool {
    settings.destination.is_object_storage()
        || settings
            .origin
            .as_ref()
            .is_some_and(|origin| origin.is_object_storage())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
