//! Backup transfer engine
//!
//! The orchestrator only depends on [`TransferEngine`]. The default
//! [`IncrementalBackup`] compares parts by relative path and size:
//! parts already present at the destination are kept, stale destination
//! parts are removed, parts found in the origin are server-side copied and
//! everything else is uploaded from the source.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{TryStreamExt, stream};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::fs::{DestinationView, OriginView, Part, SourceView};

/// Written last; its presence marks a destination as a complete backup
pub const BACKUP_COMPLETE_MARKER: &str = "backup_complete.ignore";

/// Counters reported by one transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub uploaded: usize,
    pub copied: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub bytes_uploaded: u64,
}

#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Copy `src` into `dst` with at most `concurrency` parts in flight
    async fn run(
        &self,
        concurrency: NonZeroUsize,
        src: &dyn SourceView,
        dst: &dyn DestinationView,
        origin: &dyn OriginView,
        cancel: &CancellationToken,
    ) -> Result<TransferStats>;
}

/// Default engine: incremental backup with optional server-side copy
#[derive(Debug, Clone, Copy, Default)]
pub struct IncrementalBackup;

fn context(what: &str, e: Error) -> Error {
    match e {
        Error::Cancelled(_) | Error::Transfer(_) => e,
        other => Error::Transfer(format!("{what}: {other}")),
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled("backup transfer".to_string()));
    }
    Ok(())
}

#[async_trait]
impl TransferEngine for IncrementalBackup {
    async fn run(
        &self,
        concurrency: NonZeroUsize,
        src: &dyn SourceView,
        dst: &dyn DestinationView,
        origin: &dyn OriginView,
        cancel: &CancellationToken,
    ) -> Result<TransferStats> {
        let concurrency = concurrency.get();
        tracing::info!(
            src = %src.describe(),
            dst = %dst.describe(),
            origin = %origin.describe(),
            concurrency,
            "Starting backup"
        );

        // An interrupted run must not leave an old marker behind
        match dst.delete_part(BACKUP_COMPLETE_MARKER).await {
            Ok(()) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(context("cannot remove completion marker", e)),
        }

        let src_parts = src
            .list_parts()
            .await
            .map_err(|e| context("cannot list source parts", e))?;
        let dst_parts: Vec<Part> = dst
            .list_parts()
            .await
            .map_err(|e| context("cannot list destination parts", e))?
            .into_iter()
            .filter(|p| p.path != BACKUP_COMPLETE_MARKER)
            .collect();
        let origin_parts: HashSet<Part> = origin
            .list_parts()
            .await
            .map_err(|e| context("cannot list origin parts", e))?
            .into_iter()
            .collect();

        let src_set: HashSet<&Part> = src_parts.iter().collect();
        let dst_set: HashSet<&Part> = dst_parts.iter().collect();

        let to_delete: Vec<&Part> = dst_parts.iter().filter(|p| !src_set.contains(p)).collect();
        let to_copy: Vec<&Part> = src_parts.iter().filter(|p| !dst_set.contains(p)).collect();
        let stats_unchanged = src_parts.len() - to_copy.len();
        let (reusable, mut to_upload): (Vec<&Part>, Vec<&Part>) = to_copy
            .into_iter()
            .partition(|p| origin_parts.contains(*p));

        tracing::info!(
            source_parts = src_parts.len(),
            unchanged = stats_unchanged,
            to_delete = to_delete.len(),
            to_copy = reusable.len(),
            to_upload = to_upload.len(),
            "Computed backup plan"
        );

        let deleted = AtomicUsize::new(0);
        stream::iter(to_delete.into_iter().map(Ok::<_, Error>))
            .try_for_each_concurrent(concurrency, |part| {
                let deleted = &deleted;
                async move {
                    check_cancelled(cancel)?;
                    match dst.delete_part(&part.path).await {
                        Ok(()) => {
                            deleted.fetch_add(1, Ordering::Relaxed);
                            Ok(())
                        }
                        Err(Error::NotFound(_)) => Ok(()),
                        Err(e) => Err(context(&format!("cannot delete {}", part.path), e)),
                    }
                }
            })
            .await?;

        // Parts the destination could not copy server-side fall back to upload
        let copied = AtomicUsize::new(0);
        let fallbacks = Mutex::new(Vec::new());
        stream::iter(reusable.into_iter().map(Ok::<_, Error>))
            .try_for_each_concurrent(concurrency, |part| {
                let copied = &copied;
                let fallbacks = &fallbacks;
                async move {
                    check_cancelled(cancel)?;
                    let done = dst.copy_part(origin, part).await.map_err(|e| {
                        context(&format!("cannot copy {} from origin", part.path), e)
                    })?;
                    if done {
                        copied.fetch_add(1, Ordering::Relaxed);
                    } else {
                        fallbacks
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(part);
                    }
                    Ok(())
                }
            })
            .await?;
        let copied = copied.into_inner();
        to_upload.extend(fallbacks.into_inner().unwrap_or_else(PoisonError::into_inner));

        let uploaded = AtomicUsize::new(0);
        let bytes_uploaded = AtomicU64::new(0);
        stream::iter(to_upload.into_iter().map(Ok::<_, Error>))
            .try_for_each_concurrent(concurrency, |part| {
                let uploaded = &uploaded;
                let bytes_uploaded = &bytes_uploaded;
                async move {
                    check_cancelled(cancel)?;
                    let data = src
                        .read_part(part)
                        .await
                        .map_err(|e| context(&format!("cannot read {}", part.path), e))?;
                    let len = data.len() as u64;
                    dst.write_part(part, data)
                        .await
                        .map_err(|e| context(&format!("cannot upload {}", part.path), e))?;
                    uploaded.fetch_add(1, Ordering::Relaxed);
                    bytes_uploaded.fetch_add(len, Ordering::Relaxed);
                    tracing::debug!(part = %part.path, bytes = len, "Uploaded part");
                    Ok(())
                }
            })
            .await?;

        check_cancelled(cancel)?;
        dst.write_part(&Part::new(BACKUP_COMPLETE_MARKER, 0), Bytes::new())
            .await
            .map_err(|e| context("cannot write completion marker", e))?;

        let stats = TransferStats {
            uploaded: uploaded.into_inner(),
            copied,
            deleted: deleted.into_inner(),
            unchanged: stats_unchanged,
            bytes_uploaded: bytes_uploaded.into_inner(),
        };
        tracing::info!(
            uploaded = stats.uploaded,
            copied = stats.copied,
            deleted = stats.deleted,
            unchanged = stats.unchanged,
            bytes = %humansize::format_size(stats.bytes_uploaded, humansize::BINARY),
            "Backup complete"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{LocalSource, LocalView, NilOrigin};
    use crate::path::Location;
    use crate::throttle::BandwidthLimiter;
    use std::path::Path;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, body: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn workers(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[tokio::test]
    async fn test_full_backup() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "snap/data/p1/values.bin", b"0123456789");
        write(tmp.path(), "snap/data/p2/index.bin", b"idx");

        let src = LocalSource::open(tmp.path().join("snap"), BandwidthLimiter::unlimited())
            .await
            .unwrap();
        let dst = LocalView::new(tmp.path().join("backup"));

        let stats = IncrementalBackup
            .run(workers(4), &src, &dst, &NilOrigin, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.uploaded, 2);
        assert_eq!(stats.bytes_uploaded, 13);
        assert_eq!(stats.copied, 0);
        assert_eq!(
            std::fs::read(tmp.path().join("backup/data/p1/values.bin")).unwrap(),
            b"0123456789"
        );
        assert!(tmp.path().join("backup").join(BACKUP_COMPLETE_MARKER).exists());
    }

    #[tokio::test]
    async fn test_incremental_backup_deletes_stale_parts() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "snap/data/p1/values.bin", b"same");
        write(tmp.path(), "snap/data/p3/values.bin", b"new");
        write(tmp.path(), "backup/data/p1/values.bin", b"same");
        write(tmp.path(), "backup/data/p2/values.bin", b"stale");
        write(tmp.path(), "backup/backup_complete.ignore", b"");

        let src = LocalSource::open(tmp.path().join("snap"), BandwidthLimiter::unlimited())
            .await
            .unwrap();
        let dst = LocalView::new(tmp.path().join("backup"));

        let stats = IncrementalBackup
            .run(workers(2), &src, &dst, &NilOrigin, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.unchanged, 1);
        assert_eq!(stats.uploaded, 1);
        assert_eq!(stats.deleted, 1);
        assert!(!tmp.path().join("backup/data/p2/values.bin").exists());
        assert!(tmp.path().join("backup").join(BACKUP_COMPLETE_MARKER).exists());
    }

    #[tokio::test]
    async fn test_origin_parts_are_copied() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "snap/data/p1/values.bin", b"reused");
        write(tmp.path(), "snap/data/p2/values.bin", b"fresh!");
        write(tmp.path(), "old/data/p1/values.bin", b"reused");

        let src = LocalSource::open(tmp.path().join("snap"), BandwidthLimiter::unlimited())
            .await
            .unwrap();
        let dst = LocalView::new(tmp.path().join("backup"));
        let origin = LocalView::new(tmp.path().join("old"));

        let stats = IncrementalBackup
            .run(workers(2), &src, &dst, &origin, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.copied, 1);
        assert_eq!(stats.uploaded, 1);
        assert_eq!(
            std::fs::read(tmp.path().join("backup/data/p1/values.bin")).unwrap(),
            b"reused"
        );
    }

    /// Origin in a bucket; a local destination cannot copy from it
    struct RemoteOrigin {
        location: Location,
        parts: Vec<Part>,
    }

    #[async_trait]
    impl OriginView for RemoteOrigin {
        fn describe(&self) -> String {
            self.location.to_string()
        }

        fn location(&self) -> Option<&Location> {
            Some(&self.location)
        }

        async fn list_parts(&self) -> Result<Vec<Part>> {
            Ok(self.parts.clone())
        }

        async fn stop(&self) {}
    }

    #[tokio::test]
    async fn test_uncopyable_origin_parts_are_uploaded() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "snap/data/p1/values.bin", b"reused");
        write(tmp.path(), "snap/data/p2/values.bin", b"also");
        write(tmp.path(), "snap/data/p3/values.bin", b"fresh!");

        let src = LocalSource::open(tmp.path().join("snap"), BandwidthLimiter::unlimited())
            .await
            .unwrap();
        let dst = LocalView::new(tmp.path().join("backup"));
        let origin = RemoteOrigin {
            location: Location::S3 {
                bucket: "backups".into(),
                prefix: "vm/2024-03-09-12-00".into(),
            },
            parts: vec![
                Part::new("data/p1/values.bin", 6),
                Part::new("data/p2/values.bin", 4),
            ],
        };

        let stats = IncrementalBackup
            .run(workers(3), &src, &dst, &origin, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.copied, 0);
        assert_eq!(stats.uploaded, 3);
        assert_eq!(stats.bytes_uploaded, 16);
        assert_eq!(
            std::fs::read(tmp.path().join("backup/data/p2/values.bin")).unwrap(),
            b"also"
        );
    }

    #[tokio::test]
    async fn test_cancelled_transfer() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "snap/data/p1/values.bin", b"x");

        let src = LocalSource::open(tmp.path().join("snap"), BandwidthLimiter::unlimited())
            .await
            .unwrap();
        let dst = LocalView::new(tmp.path().join("backup"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = IncrementalBackup
            .run(workers(1), &src, &dst, &NilOrigin, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(!tmp.path().join("backup").join(BACKUP_COMPLETE_MARKER).exists());
    }
}
