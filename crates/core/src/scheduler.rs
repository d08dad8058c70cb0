//! Periodic cycle scheduler
//!
//! Runs a cycle immediately and then on every interval tick. Each cycle is a
//! separate task supervised by the scheduler: its result is logged and
//! counted, and a failing or panicking cycle never stops later ticks.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use jiff::Timestamp;
use jiff::tz::TimeZone;
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::config::format_duration;
use crate::cycle::Orchestrator;

/// Counters of launched and finished cycles
#[derive(Debug, Default)]
pub struct SchedulerStats {
    launched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl SchedulerStats {
    pub fn launched(&self) -> u64 {
        self.launched.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Ticks dropped because `max_concurrent_cycles` cycles were running
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
    limit: Option<Arc<Semaphore>>,
    stats: Arc<SchedulerStats>,
    cycles: TaskTracker,
}

impl Scheduler {
    /// `max_concurrent_cycles == 0` means unbounded
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration, max_concurrent_cycles: usize) -> Self {
        Self {
            orchestrator,
            interval,
            limit: (max_concurrent_cycles > 0).then(|| Arc::new(Semaphore::new(max_concurrent_cycles))),
            stats: Arc::new(SchedulerStats::default()),
            cycles: TaskTracker::new(),
        }
    }

    /// Scheduler using the interval and cycle cap of the orchestrator's settings
    pub fn from_settings(orchestrator: Arc<Orchestrator>) -> Self {
        let settings = orchestrator.settings();
        let (interval, cap) = (settings.interval, settings.max_concurrent_cycles);
        Self::new(orchestrator, interval, cap)
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Tick until `shutdown` is cancelled, then wait for running cycles and sweeps
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval = %format_duration(self.interval), "Scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.launch(&shutdown),
            }
        }

        tracing::info!(tasks = self.cycles.len(), "Shutting down, waiting for running cycles");
        self.cycles.close();
        self.cycles.wait().await;

        let sweeps = self.orchestrator.sweeps();
        sweeps.close();
        sweeps.wait().await;

        tracing::info!(
            launched = self.stats.launched(),
            succeeded = self.stats.succeeded(),
            failed = self.stats.failed(),
            skipped = self.stats.skipped(),
            "Scheduler stopped"
        );
    }

    fn launch(&self, shutdown: &CancellationToken) {
        let permit = match &self.limit {
            Some(limit) => match limit.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Skipping backup cycle, previous cycles still running");
                    return;
                }
            },
            None => None,
        };

        let id = self.stats.launched.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Timestamp::now().to_zoned(TimeZone::UTC);
        let orchestrator = self.orchestrator.clone();
        let cancel = shutdown.child_token();

        let cycle = self.cycles.spawn(
            async move {
                let _permit = permit;
                orchestrator.run_cycle(&started, cancel).await
            }
            .instrument(tracing::info_span!("cycle", id)),
        );

        let stats = self.stats.clone();
        self.cycles.spawn(async move {
            match cycle.await {
                Ok(Ok(report)) => {
                    stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        cycle = id,
                        destination = %report.destination,
                        snapshot = %report.snapshot,
                        uploaded = report.transfer.uploaded,
                        copied = report.transfer.copied,
                        "Backup cycle finished"
                    );
                }
                Ok(Err(e)) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(cycle = id, kind = e.kind(), error = %e, "Backup cycle failed");
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(cycle = id, error = %e, "Backup cycle task aborted");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupSettings, SettingsBuilder};
    use crate::error::Result;
    use crate::fs::LocalViews;
    use crate::traits::SnapshotApi;
    use crate::transfer::IncrementalBackup;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Snapshot API whose create call takes a long time
    #[derive(Default)]
    struct SlowSnapshots {
        created: AtomicUsize,
        deleted: AtomicUsize,
    }

    #[async_trait]
    impl SnapshotApi for SlowSnapshots {
        async fn create(&self, _create_url: &str) -> Result<String> {
            self.created.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok("20240310123400-0000000000000001".to_string())
        }

        async fn delete(&self, _delete_url: &str, _name: &str) -> Result<()> {
            self.deleted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn settings(data: &Path, max_concurrent_cycles: usize) -> Arc<BackupSettings> {
        let builder = SettingsBuilder {
            storage_data_path: Some(data.to_path_buf()),
            snapshot_create_url: Some("http://vm:8428/snapshot/create".to_string()),
            dst: Some("fs:///tmp/unused".to_string()),
            interval: Some("60s".to_string()),
            max_concurrent_cycles: Some(max_concurrent_cycles),
            ..Default::default()
        };
        Arc::new(builder.build().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycles_do_not_stop_ticks() {
        let tmp = TempDir::new().unwrap();
        let snapshots = Arc::new(SlowSnapshots::default());
        let orchestrator = Orchestrator::new(
            settings(&tmp.path().join("missing"), 0),
            snapshots.clone(),
            Arc::new(LocalViews),
            Arc::new(IncrementalBackup),
        );
        let scheduler = Scheduler::from_settings(Arc::new(orchestrator));
        let stats = scheduler.stats();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(shutdown.clone()));

        // Ticks at 0s, 60s and 120s
        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(stats.launched(), 3);
        assert_eq!(stats.failed(), 3);
        assert_eq!(stats.succeeded(), 0);
        assert_eq!(snapshots.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_ticks_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let snapshots = Arc::new(SlowSnapshots::default());
        let orchestrator = Orchestrator::new(
            settings(tmp.path(), 1),
            snapshots.clone(),
            Arc::new(LocalViews),
            Arc::new(IncrementalBackup),
        );
        let scheduler = Scheduler::from_settings(Arc::new(orchestrator));
        let stats = scheduler.stats();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(150)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(stats.launched(), 1);
        assert_eq!(stats.skipped(), 2);
        // The running cycle still cleans up its snapshot on shutdown
        assert_eq!(snapshots.created.load(Ordering::SeqCst), 1);
        assert_eq!(snapshots.deleted.load(Ordering::SeqCst), 1);
    }
}
