//! Local filesystem views
//!
//! `LocalSource` reads a snapshot directory; `LocalView` is an `fs://`
//! destination or origin.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use walkdir::WalkDir;

use super::{DestinationView, NilOrigin, OriginView, Part, SourceView, ViewFactory};
use crate::error::{Error, Result};
use crate::path::Location;
use crate::throttle::BandwidthLimiter;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Snapshot directory on the local (or mounted) filesystem
#[derive(Debug)]
pub struct LocalSource {
    dir: PathBuf,
    limiter: BandwidthLimiter,
}

impl LocalSource {
    /// Open a snapshot directory, verifying that it exists and is a directory
    pub async fn open(dir: impl Into<PathBuf>, limiter: BandwidthLimiter) -> Result<Self> {
        let dir = dir.into();
        let metadata = tokio::fs::metadata(&dir).await.map_err(|e| {
            Error::SourceValidation(format!("cannot open snapshot at {}: {e}", dir.display()))
        })?;
        if !metadata.is_dir() {
            return Err(Error::SourceValidation(format!(
                "snapshot {} must be a directory",
                dir.display()
            )));
        }
        Ok(Self { dir, limiter })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn limiter(&self) -> &BandwidthLimiter {
        &self.limiter
    }
}

#[async_trait]
impl SourceView for LocalSource {
    fn describe(&self) -> String {
        format!("fslocal {}", self.dir.display())
    }

    async fn list_parts(&self) -> Result<Vec<Part>> {
        walk_parts(self.dir.clone()).await
    }

    async fn read_part(&self, part: &Part) -> Result<Bytes> {
        let path = self.dir.join(&part.path);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Error::Transfer(format!("cannot open {}: {e}", path.display())))?;

        let mut data = BytesMut::with_capacity(part.size as usize);
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let n = file
                .read(&mut chunk)
                .await
                .map_err(|e| Error::Transfer(format!("cannot read {}: {e}", path.display())))?;
            if n == 0 {
                break;
            }
            self.limiter.acquire(n as u64).await?;
            data.extend_from_slice(&chunk[..n]);
        }
        Ok(data.freeze())
    }

    async fn stop(&self) {
        tracing::debug!(dir = %self.dir.display(), "Stopped local source");
    }
}

/// `fs://` backup directory, usable as destination and as origin
#[derive(Debug, Clone)]
pub struct LocalView {
    location: Location,
    dir: PathBuf,
}

impl LocalView {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            location: Location::Local(dir.clone()),
            dir,
        }
    }

    fn part_path(&self, path: &str) -> PathBuf {
        self.dir.join(path)
    }
}

#[async_trait]
impl DestinationView for LocalView {
    fn describe(&self) -> String {
        self.location.to_string()
    }

    fn location(&self) -> &Location {
        &self.location
    }

    async fn list_parts(&self) -> Result<Vec<Part>> {
        walk_parts(self.dir.clone()).await
    }

    async fn write_part(&self, part: &Part, data: Bytes) -> Result<()> {
        let target = self.part_path(&part.path);
        ensure_parent(&target).await?;

        tokio::task::spawn_blocking(move || write_atomically(&target, &data))
            .await
            .map_err(|e| Error::General(format!("write task failed: {e}")))?
    }

    async fn delete_part(&self, path: &str) -> Result<()> {
        let target = self.part_path(path);
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(target.display().to_string()))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn copy_part(&self, origin: &dyn OriginView, part: &Part) -> Result<bool> {
        let Some(Location::Local(origin_dir)) = origin.location() else {
            return Ok(false);
        };

        let src = origin_dir.join(&part.path);
        let target = self.part_path(&part.path);
        ensure_parent(&target).await?;
        tokio::fs::copy(&src, &target).await.map_err(|e| {
            Error::Transfer(format!(
                "cannot copy {} to {}: {e}",
                src.display(),
                target.display()
            ))
        })?;
        Ok(true)
    }

    async fn stop(&self) {}
}

#[async_trait]
impl OriginView for LocalView {
    fn describe(&self) -> String {
        self.location.to_string()
    }

    fn location(&self) -> Option<&Location> {
        Some(&self.location)
    }

    async fn list_parts(&self) -> Result<Vec<Part>> {
        walk_parts(self.dir.clone()).await
    }

    async fn stop(&self) {}
}

/// View factory that only understands local locations
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalViews;

#[async_trait]
impl ViewFactory for LocalViews {
    async fn source(&self, dir: &Path, limiter: BandwidthLimiter) -> Result<Box<dyn SourceView>> {
        Ok(Box::new(LocalSource::open(dir, limiter).await?))
    }

    async fn destination(&self, location: &Location) -> Result<Box<dyn DestinationView>> {
        match location {
            Location::Local(dir) => Ok(Box::new(LocalView::new(dir.clone()))),
            Location::S3 { .. } => Err(Error::InvalidPath(format!(
                "{location} needs an object-storage session"
            ))),
        }
    }

    async fn origin(&self, location: Option<&Location>) -> Result<Box<dyn OriginView>> {
        match location {
            None => Ok(Box::new(NilOrigin)),
            Some(Location::Local(dir)) => Ok(Box::new(LocalView::new(dir.clone()))),
            Some(other) => Err(Error::InvalidPath(format!(
                "{other} needs an object-storage session"
            ))),
        }
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Transfer(format!("cannot create {}: {e}", parent.display())))?;
    }
    Ok(())
}

/// Write to a uniquely named file next to `target`, then rename it into place
///
/// A crashed upload never looks complete, and concurrent writers never share
/// a temporary file.
fn write_atomically(target: &Path, data: &[u8]) -> Result<()> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".snapkeeper-")
        .suffix(".partial")
        .tempfile_in(dir)
        .map_err(|e| Error::Transfer(format!("cannot create temporary file in {}: {e}", dir.display())))?;
    tmp.write_all(data)
        .map_err(|e| Error::Transfer(format!("cannot write {}: {e}", tmp.path().display())))?;
    tmp.persist(target).map_err(|e| {
        Error::Transfer(format!("cannot rename to {}: {}", target.display(), e.error))
    })?;
    Ok(())
}

/// List every regular file below `root`, following symlinks
///
/// A missing root is an empty listing.
async fn walk_parts(root: PathBuf) -> Result<Vec<Part>> {
    if !tokio::fs::try_exists(&root).await.unwrap_or(false) {
        return Ok(Vec::new());
    }

    tokio::task::spawn_blocking(move || {
        let mut parts = Vec::new();
        for entry in WalkDir::new(&root).follow_links(true) {
            let entry = entry
                .map_err(|e| Error::General(format!("cannot walk {}: {e}", root.display())))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(&root)
                .map_err(|e| Error::General(e.to_string()))?;
            let path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let size = entry
                .metadata()
                .map_err(|e| Error::General(format!("cannot stat {path}: {e}")))?
                .len();
            parts.push(Part::new(path, size));
        }
        parts.sort();
        Ok(parts)
    })
    .await
    .map_err(|e| Error::General(format!("directory walk task failed: {e}")))?
}
