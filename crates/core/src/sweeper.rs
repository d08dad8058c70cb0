//! Retention cleanup sweep
//!
//! Deletes every object older than the retention window in every bucket
//! visible to the storage session. The retention window is the only thing
//! protecting a backup that is still being written, so it must exceed the
//! longest backup cycle.

use std::sync::Arc;

use jiff::{SignedDuration, Timestamp};
use tokio_util::sync::CancellationToken;

use crate::config::{RetentionPolicy, format_duration};
use crate::error::{Error, Result};
use crate::traits::{ListOptions, ObjectStore};

/// Counters reported by one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub buckets: usize,
    pub scanned: usize,
    pub deleted: usize,
    pub retained: usize,
    /// Expired objects that were already gone when deleted
    pub skipped: usize,
    /// Expired objects whose deletion failed
    pub failed: usize,
}

/// Sweeper bound to one shared storage session
#[derive(Clone)]
pub struct RetentionSweeper {
    store: Arc<dyn ObjectStore>,
    policy: RetentionPolicy,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn ObjectStore>, policy: RetentionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    /// Objects last modified strictly before this instant are expired
    pub fn cutoff(&self, now: Timestamp) -> Result<Timestamp> {
        let window = SignedDuration::try_from(self.policy.window)
            .map_err(|e| Error::Config(format!("retention window out of range: {e}")))?;
        now.checked_sub(window)
            .map_err(|e| Error::Config(format!("retention window out of range: {e}")))
    }

    pub async fn sweep(&self, cancel: &CancellationToken) -> Result<SweepReport> {
        self.sweep_at(Timestamp::now(), cancel).await
    }

    /// Run one sweep as if the current time were `now`
    pub async fn sweep_at(&self, now: Timestamp, cancel: &CancellationToken) -> Result<SweepReport> {
        let cutoff = self.cutoff(now)?;
        tracing::info!(
            retention = %format_duration(self.policy.window),
            %cutoff,
            "Starting retention sweep"
        );

        let buckets = self
            .store
            .list_buckets()
            .await
            .map_err(|e| Error::Enumeration(format!("cannot list buckets: {e}")))?;

        let mut report = SweepReport::default();
        for bucket in &buckets {
            self.sweep_bucket(bucket, cutoff, cancel, &mut report).await?;
            report.buckets += 1;
        }

        tracing::info!(
            buckets = report.buckets,
            scanned = report.scanned,
            deleted = report.deleted,
            retained = report.retained,
            skipped = report.skipped,
            failed = report.failed,
            "Retention sweep finished"
        );
        Ok(report)
    }

    async fn sweep_bucket(
        &self,
        bucket: &str,
        cutoff: Timestamp,
        cancel: &CancellationToken,
        report: &mut SweepReport,
    ) -> Result<()> {
        // Collect every page first so deletions cannot disturb pagination
        let mut expired = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!("retention sweep of bucket {bucket}")));
            }

            let options = ListOptions {
                max_keys: Some(self.policy.page_size),
                continuation_token: continuation_token.take(),
                ..Default::default()
            };
            let page = self.store.list_objects(bucket, options).await.map_err(|e| {
                Error::Enumeration(format!("cannot list objects in bucket {bucket}: {e}"))
            })?;

            for item in page.items {
                report.scanned += 1;
                match item.last_modified {
                    Some(modified) if modified < cutoff => expired.push((item.key, modified)),
                    _ => report.retained += 1,
                }
            }

            match (page.truncated, page.continuation_token) {
                (true, Some(token)) => continuation_token = Some(token),
                (true, None) => {
                    tracing::warn!(bucket, "Truncated listing without continuation token");
                    break;
                }
                (false, _) => break,
            }
        }

        tracing::debug!(bucket, expired = expired.len(), "Scanned bucket");

        for (key, modified) in expired {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!("retention sweep of bucket {bucket}")));
            }

            tracing::info!(bucket, key = %key, last_modified = %modified, "Deleting expired object");
            match self.store.delete_object(bucket, &key).await {
                Ok(()) => report.deleted += 1,
                Err(Error::NotFound(_)) => {
                    tracing::debug!(bucket, key = %key, "Expired object already gone");
                    report.skipped += 1;
                }
                Err(e) => {
                    let e = Error::Deletion(format!("{bucket}/{key}: {e}"));
                    tracing::warn!(kind = e.kind(), error = %e, "Failed to delete expired object");
                    report.failed += 1;
                }
            }
        }

        Ok(())
    }
}
