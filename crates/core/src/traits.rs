//! Collaborator traits
//!
//! The orchestrator and the sweeper only talk to the outside world through
//! these traits. Concrete S3 and HTTP implementations live in `sk-s3`.

use async_trait::async_trait;
use jiff::Timestamp;

use crate::error::Result;

/// Metadata for one stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size_bytes: Option<i64>,
    pub last_modified: Option<Timestamp>,
}

impl ObjectInfo {
    pub fn new(key: impl Into<String>, last_modified: Option<Timestamp>) -> Self {
        Self {
            key: key.into(),
            size_bytes: None,
            last_modified,
        }
    }
}

/// Options for one object listing request
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: Option<String>,
    pub max_keys: Option<i32>,
    pub continuation_token: Option<String>,
}

/// One page of an object listing
#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub items: Vec<ObjectInfo>,
    pub truncated: bool,
    pub continuation_token: Option<String>,
}

/// Object-storage operations needed by the retention sweep
///
/// Implementations are shared between concurrent sweeps and must accept
/// concurrent calls without external locking.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List every bucket visible to the current credentials
    async fn list_buckets(&self) -> Result<Vec<String>>;

    /// List one page of objects in `bucket`
    async fn list_objects(&self, bucket: &str, options: ListOptions) -> Result<ListResult>;

    /// Delete one object; a missing key yields `Error::NotFound`
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;
}

/// Remote creation and deletion of database snapshots
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotApi: Send + Sync {
    /// Create a snapshot and return its name
    async fn create(&self, create_url: &str) -> Result<String>;

    async fn delete(&self, delete_url: &str, name: &str) -> Result<()>;
}
