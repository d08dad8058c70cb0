//! Filesystem views used by the transfer engine
//!
//! A backup copies *parts* (files addressed by their path relative to the
//! view root) from a source view to a destination view, optionally reusing
//! parts that already exist in an origin view.

mod local;
mod nil;

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::path::Location;
use crate::throttle::BandwidthLimiter;

pub use local::{LocalSource, LocalView, LocalViews};
pub use nil::NilOrigin;

/// One file of a backup, identified by relative path and size
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Part {
    /// Path relative to the view root, always `/`-separated
    pub path: String,
    pub size: u64,
}

impl Part {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }
}

/// Read side of a backup: the snapshot directory
#[async_trait]
pub trait SourceView: Send + Sync {
    fn describe(&self) -> String;

    async fn list_parts(&self) -> Result<Vec<Part>>;

    /// Read a whole part, honouring the view's bandwidth limiter
    async fn read_part(&self, part: &Part) -> Result<Bytes>;

    /// Release background resources held by the view
    async fn stop(&self);
}

/// Write side of a backup
#[async_trait]
pub trait DestinationView: Send + Sync {
    fn describe(&self) -> String;

    fn location(&self) -> &Location;

    async fn list_parts(&self) -> Result<Vec<Part>>;

    async fn write_part(&self, part: &Part, data: Bytes) -> Result<()>;

    /// Delete a part; a missing part yields `Error::NotFound`
    async fn delete_part(&self, path: &str) -> Result<()>;

    /// Copy `part` from `origin` without routing the data through this
    /// process. Returns `Ok(false)` when the pair of views cannot do that.
    async fn copy_part(&self, origin: &dyn OriginView, part: &Part) -> Result<bool>;

    async fn stop(&self);
}

/// A previous backup whose parts may be reused by server-side copy
#[async_trait]
pub trait OriginView: Send + Sync {
    fn describe(&self) -> String;

    /// `None` for the no-op origin
    fn location(&self) -> Option<&Location>;

    async fn list_parts(&self) -> Result<Vec<Part>>;

    async fn stop(&self);
}

/// Builds the three views of a cycle
#[async_trait]
pub trait ViewFactory: Send + Sync {
    /// Open the snapshot directory; fails with `Error::SourceValidation`
    /// unless `dir` exists and is a directory
    async fn source(&self, dir: &Path, limiter: BandwidthLimiter) -> Result<Box<dyn SourceView>>;

    async fn destination(&self, location: &Location) -> Result<Box<dyn DestinationView>>;

    /// `None` yields a [`NilOrigin`]
    async fn origin(&self, location: Option<&Location>) -> Result<Box<dyn OriginView>>;
}
