//! Backup-cycle orchestrator
//!
//! One cycle: create a snapshot, open the source/destination/origin views,
//! launch a retention sweep, run the transfer engine, stop the views and
//! delete the snapshot. Once a snapshot has been created it is deleted on
//! every exit path, including a panic inside the backup step.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use jiff::Zoned;
use jiff::tz::TimeZone;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{BackupSettings, SnapshotSource, format_duration};
use crate::error::{Error, Result};
use crate::fs::{DestinationView, OriginView, SourceView, ViewFactory};
use crate::path::Location;
use crate::retry::{is_retryable_error, retry_with_backoff};
use crate::sweeper::RetentionSweeper;
use crate::throttle::BandwidthLimiter;
use crate::traits::SnapshotApi;
use crate::transfer::{TransferEngine, TransferStats};

/// strftime pattern of the per-cycle destination directory
pub const DESTINATION_TIME_FORMAT: &str = "%Y-%m-%d-%H-%M";

/// Destination of a cycle started at `started`, named in UTC
///
/// Minute resolution: cycles started within the same minute share a
/// destination, cycles a minute apart never do. UTC has no repeated wall
/// clock hours, so this holds across DST transitions too.
pub fn cycle_destination(base: &Location, started: &Zoned) -> Location {
    let utc = started.with_time_zone(TimeZone::UTC);
    base.join(&utc.strftime(DESTINATION_TIME_FORMAT).to_string())
}

/// Outcome of a successful cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub destination: Location,
    pub snapshot: String,
    pub transfer: TransferStats,
}

pub struct Orchestrator {
    settings: Arc<BackupSettings>,
    snapshots: Arc<dyn SnapshotApi>,
    views: Arc<dyn ViewFactory>,
    engine: Arc<dyn TransferEngine>,
    sweeper: Option<RetentionSweeper>,
    sweeps: TaskTracker,
}

impl Orchestrator {
    pub fn new(
        settings: Arc<BackupSettings>,
        snapshots: Arc<dyn SnapshotApi>,
        views: Arc<dyn ViewFactory>,
        engine: Arc<dyn TransferEngine>,
    ) -> Self {
        Self {
            settings,
            snapshots,
            views,
            engine,
            sweeper: None,
            sweeps: TaskTracker::new(),
        }
    }

    /// Launch `sweeper` once per cycle against the destination endpoint
    pub fn with_sweeper(mut self, sweeper: RetentionSweeper) -> Self {
        self.sweeper = Some(sweeper);
        self
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    /// Tracker of the detached sweep tasks
    pub fn sweeps(&self) -> &TaskTracker {
        &self.sweeps
    }

    /// Run one complete backup cycle
    pub async fn run_cycle(&self, started: &Zoned, cancel: CancellationToken) -> Result<CycleReport> {
        let destination = cycle_destination(&self.settings.destination, started);
        tracing::info!(%destination, "Starting backup cycle");

        self.check_storage_data_path().await?;

        match &self.settings.snapshot {
            SnapshotSource::Existing(name) => {
                self.backup_snapshot(name, destination, &cancel).await
            }
            SnapshotSource::AutoCreate {
                create_url,
                delete_url,
            } => {
                let name = retry_with_backoff(
                    &self.settings.retry,
                    "snapshot create",
                    || self.snapshots.create(create_url),
                    is_retryable_error,
                )
                .await
                .map_err(|e| Error::Snapshot(format!("cannot create snapshot via {create_url}: {e}")))?;
                tracing::info!(snapshot = %name, "Created snapshot");

                let outcome = AssertUnwindSafe(self.backup_snapshot(&name, destination, &cancel))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(Error::General(format!(
                            "backup of snapshot {name} panicked: {}",
                            panic_message(&*panic)
                        )))
                    });

                let deleted = retry_with_backoff(
                    &self.settings.retry,
                    "snapshot delete",
                    || self.snapshots.delete(delete_url, &name),
                    is_retryable_error,
                )
                .await;

                match (outcome, deleted) {
                    (outcome, Ok(())) => {
                        tracing::info!(snapshot = %name, "Deleted snapshot");
                        outcome
                    }
                    (Ok(_), Err(e)) => Err(Error::Snapshot(format!(
                        "cannot delete snapshot {name} via {delete_url}: {e}"
                    ))),
                    (Err(backup_err), Err(e)) => {
                        tracing::error!(
                            snapshot = %name,
                            error = %e,
                            "Cannot delete snapshot after failed backup"
                        );
                        Err(backup_err)
                    }
                }
            }
        }
    }

    async fn check_storage_data_path(&self) -> Result<()> {
        let path = &self.settings.storage_data_path;
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            Error::SourceValidation(format!("cannot open storage data path {}: {e}", path.display()))
        })?;
        if !metadata.is_dir() {
            return Err(Error::SourceValidation(format!(
                "storage data path {} must be a directory",
                path.display()
            )));
        }
        Ok(())
    }

    async fn backup_snapshot(
        &self,
        snapshot: &str,
        destination: Location,
        cancel: &CancellationToken,
    ) -> Result<CycleReport> {
        let settings = &self.settings;
        let limiter = BandwidthLimiter::new(settings.max_bytes_per_second);

        let src = self.views.source(&settings.snapshot_dir(snapshot), limiter).await?;
        let dst = match self.views.destination(&destination).await {
            Ok(dst) => dst,
            Err(e) => {
                src.stop().await;
                return Err(e);
            }
        };
        let origin = match self.views.origin(settings.origin.as_ref()).await {
            Ok(origin) => origin,
            Err(e) => {
                src.stop().await;
                dst.stop().await;
                return Err(e);
            }
        };

        self.launch_sweep(&destination, cancel);

        let result = self.transfer(&*src, &*dst, &*origin, cancel).await;

        src.stop().await;
        dst.stop().await;
        origin.stop().await;

        let transfer = result?;
        Ok(CycleReport {
            destination,
            snapshot: snapshot.to_string(),
            transfer,
        })
    }

    async fn transfer(
        &self,
        src: &dyn SourceView,
        dst: &dyn DestinationView,
        origin: &dyn OriginView,
        cancel: &CancellationToken,
    ) -> Result<TransferStats> {
        let run = self
            .engine
            .run(self.settings.concurrency, src, dst, origin, cancel);

        match self.settings.max_cycle_duration {
            Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                Error::Timeout(format!("transfer exceeded {}", format_duration(limit)))
            })?,
            None => run.await,
        }
    }

    fn launch_sweep(&self, destination: &Location, cancel: &CancellationToken) {
        let Some(sweeper) = self.sweeper.clone() else {
            return;
        };
        if !destination.is_object_storage() {
            tracing::debug!(%destination, "Skipping retention sweep for local destination");
            return;
        }

        let cancel = cancel.clone();
        self.sweeps.spawn(async move {
            if let Err(e) = sweeper.sweep(&cancel).await {
                tracing::error!(kind = e.kind(), error = %e, "Retention sweep failed");
            }
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
