//! sk-core: backup-cycle orchestration for snapkeeper
//!
//! This crate provides the storage-independent parts of snapkeeper:
//! - Settings layering and validation
//! - Backup location parsing
//! - The cycle orchestrator and its periodic scheduler
//! - The retention sweeper over an `ObjectStore`
//! - The incremental transfer engine and local filesystem views
//!
//! Object storage and the snapshot HTTP API are reached only through the
//! traits in [`traits`] and [`fs`], implemented by the `sk-s3` crate.

pub mod config;
pub mod cycle;
pub mod error;
pub mod fs;
pub mod path;
pub mod retry;
pub mod scheduler;
pub mod sweeper;
pub mod throttle;
pub mod traits;
pub mod transfer;

pub use config::{
    BackupSettings, RetentionPolicy, RetryConfig, SettingsBuilder, SnapshotSource,
    StorageSettings,
};
pub use cycle::{CycleReport, Orchestrator, cycle_destination};
pub use error::{Error, Result};
pub use fs::{DestinationView, OriginView, Part, SourceView, ViewFactory};
pub use path::{Location, parse_location};
pub use retry::{is_retryable_error, retry_with_backoff};
pub use scheduler::{Scheduler, SchedulerStats};
pub use sweeper::{RetentionSweeper, SweepReport};
pub use throttle::BandwidthLimiter;
pub use traits::{ListOptions, ListResult, ObjectInfo, ObjectStore, SnapshotApi};
pub use transfer::{BACKUP_COMPLETE_MARKER, IncrementalBackup, TransferEngine, TransferStats};
