//! Settings for the backup scheduler
//!
//! Settings arrive in layers (config file, then environment/flags) as a
//! [`SettingsBuilder`] and are validated once into an immutable
//! [`BackupSettings`] before any cycle is scheduled.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::path::{Location, parse_location};

/// Default storage data path of a single-node VictoriaMetrics instance
pub const DEFAULT_STORAGE_DATA_PATH: &str = "victoria-metrics-data";
pub const DEFAULT_CONCURRENCY: usize = 10;
pub const DEFAULT_RETENTION: &str = "30d";
pub const DEFAULT_INTERVAL: &str = "60m";
pub const DEFAULT_REGION: &str = "us-east-1";

/// Retry behaviour for snapshot API calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
        }
    }
}

/// Where a cycle's snapshot comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotSource {
    /// Operator-managed snapshot; never deleted by snapkeeper
    Existing(String),
    /// Snapshot created at the start of each cycle and deleted at its end
    AutoCreate {
        create_url: String,
        delete_url: String,
    },
}

/// Retention applied by the cleanup sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Objects older than this are deleted
    pub window: Duration,
    /// Keys requested per listing page
    pub page_size: i32,
}

impl RetentionPolicy {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            page_size: 1000,
        }
    }
}

/// Connection settings for the object-storage endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub region: String,
    /// Custom endpoint URL for S3-compatible services (MinIO, Ceph, ...)
    pub endpoint: Option<String>,
    pub force_path_style: bool,
}

/// Validated, immutable process settings
#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub storage_data_path: PathBuf,
    pub snapshot: SnapshotSource,
    pub destination: Location,
    pub origin: Option<Location>,
    pub concurrency: NonZeroUsize,
    /// Bytes per second read from the source; 0 means unlimited
    pub max_bytes_per_second: u64,
    pub retention: RetentionPolicy,
    pub interval: Duration,
    /// Upper bound for the transfer step of one cycle
    pub max_cycle_duration: Option<Duration>,
    /// 0 means cycles may overlap without bound
    pub max_concurrent_cycles: usize,
    pub storage: StorageSettings,
    pub retry: RetryConfig,
}

impl BackupSettings {
    /// Directory holding the named snapshot below the storage data path
    pub fn snapshot_dir(&self, name: &str) -> PathBuf {
        self.storage_data_path.join("snapshots").join(name)
    }
}

/// One layer of unvalidated settings
///
/// Every field is optional so that layers can be stacked with
/// [`SettingsBuilder::overlay`]. The same shape is read from TOML config files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsBuilder {
    pub storage_data_path: Option<PathBuf>,
    pub snapshot_name: Option<String>,
    pub snapshot_create_url: Option<String>,
    pub snapshot_delete_url: Option<String>,
    pub dst: Option<String>,
    pub origin: Option<String>,
    pub concurrency: Option<usize>,
    pub max_bytes_per_second: Option<String>,
    pub retention: Option<String>,
    pub interval: Option<String>,
    pub max_cycle_duration: Option<String>,
    pub max_concurrent_cycles: Option<usize>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub force_path_style: Option<bool>,
    pub retry_attempts: Option<u32>,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a settings layer from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid config file: {e}")))
    }

    /// Read a settings layer from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Stack `higher` on top of `self`; values set in `higher` win
    pub fn overlay(self, higher: SettingsBuilder) -> Self {
        Self {
            storage_data_path: higher.storage_data_path.or(self.storage_data_path),
            snapshot_name: higher.snapshot_name.or(self.snapshot_name),
            snapshot_create_url: higher.snapshot_create_url.or(self.snapshot_create_url),
            snapshot_delete_url: higher.snapshot_delete_url.or(self.snapshot_delete_url),
            dst: higher.dst.or(self.dst),
            origin: higher.origin.or(self.origin),
            concurrency: higher.concurrency.or(self.concurrency),
            max_bytes_per_second: higher.max_bytes_per_second.or(self.max_bytes_per_second),
            retention: higher.retention.or(self.retention),
            interval: higher.interval.or(self.interval),
            max_cycle_duration: higher.max_cycle_duration.or(self.max_cycle_duration),
            max_concurrent_cycles: higher.max_concurrent_cycles.or(self.max_concurrent_cycles),
            access_key: higher.access_key.or(self.access_key),
            secret_key: higher.secret_key.or(self.secret_key),
            region: higher.region.or(self.region),
            endpoint: higher.endpoint.or(self.endpoint),
            force_path_style: higher.force_path_style.or(self.force_path_style),
            retry_attempts: higher.retry_attempts.or(self.retry_attempts),
        }
    }

    /// Validate this layer into final settings
    pub fn build(self) -> Result<BackupSettings> {
        let snapshot = resolve_snapshot_source(
            non_empty(self.snapshot_name),
            non_empty(self.snapshot_create_url),
            non_empty(self.snapshot_delete_url),
        )?;

        let dst = non_empty(self.dst)
            .ok_or_else(|| Error::Config("`dst` must be provided".to_string()))?;
        let destination = parse_location(&dst)
            .map_err(|e| Error::Config(format!("cannot parse `dst`={dst:?}: {e}")))?;

        let origin = non_empty(self.origin)
            .map(|o| {
                parse_location(&o)
                    .map_err(|e| Error::Config(format!("cannot parse `origin`={o:?}: {e}")))
            })
            .transpose()?;

        let concurrency = NonZeroUsize::new(self.concurrency.unwrap_or(DEFAULT_CONCURRENCY))
            .ok_or_else(|| Error::Config("`concurrency` must be a positive integer".to_string()))?;

        let max_bytes_per_second = match non_empty(self.max_bytes_per_second) {
            Some(s) => parse_size(&s)
                .map_err(|e| Error::Config(format!("invalid `max_bytes_per_second`: {e}")))?,
            None => 0,
        };

        let retention_str = non_empty(self.retention).unwrap_or_else(|| DEFAULT_RETENTION.into());
        let window = parse_duration(&retention_str)
            .map_err(|e| Error::Config(format!("invalid `retention`: {e}")))?;

        let interval_str = non_empty(self.interval).unwrap_or_else(|| DEFAULT_INTERVAL.into());
        let interval = parse_duration(&interval_str)
            .map_err(|e| Error::Config(format!("invalid `interval`: {e}")))?;

        let max_cycle_duration = non_empty(self.max_cycle_duration)
            .map(|s| {
                parse_duration(&s)
                    .map_err(|e| Error::Config(format!("invalid `max_cycle_duration`: {e}")))
            })
            .transpose()?;

        if let Some(max_cycle) = max_cycle_duration
            && window <= max_cycle
        {
            return Err(Error::Config(format!(
                "retention window {} must exceed max cycle duration {}; \
                 a sweep could delete a backup that is still being written",
                retention_str,
                format_duration(max_cycle)
            )));
        }

        let retry = RetryConfig {
            max_attempts: self.retry_attempts.unwrap_or(RetryConfig::default().max_attempts).max(1),
            ..RetryConfig::default()
        };

        Ok(BackupSettings {
            storage_data_path: self
                .storage_data_path
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DATA_PATH)),
            snapshot,
            destination,
            origin,
            concurrency,
            max_bytes_per_second,
            retention: RetentionPolicy::new(window),
            interval,
            max_cycle_duration,
            max_concurrent_cycles: self.max_concurrent_cycles.unwrap_or(0),
            storage: StorageSettings {
                access_key: non_empty(self.access_key),
                secret_key: non_empty(self.secret_key),
                region: non_empty(self.region).unwrap_or_else(|| DEFAULT_REGION.to_string()),
                endpoint: non_empty(self.endpoint),
                force_path_style: self.force_path_style.unwrap_or(true),
            },
            retry,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn resolve_snapshot_source(
    name: Option<String>,
    create_url: Option<String>,
    delete_url: Option<String>,
) -> Result<SnapshotSource> {
    match (name, create_url) {
        (Some(_), Some(_)) => Err(Error::Config(
            "`snapshot_name` shouldn't be set if `snapshot_create_url` is set, \
             since snapshots are created automatically in this case"
                .to_string(),
        )),
        (None, None) => Err(Error::Config(
            "`snapshot_name` or `snapshot_create_url` must be provided".to_string(),
        )),
        (Some(name), None) => Ok(SnapshotSource::Existing(name)),
        (None, Some(create_url)) => {
            url::Url::parse(&create_url).map_err(|e| {
                Error::Config(format!("invalid `snapshot_create_url` {create_url:?}: {e}"))
            })?;
            let delete_url = match delete_url {
                Some(url) => url,
                None => derive_delete_url(&create_url)?,
            };
            Ok(SnapshotSource::AutoCreate {
                create_url,
                delete_url,
            })
        }
    }
}

/// Derive the snapshot delete URL from the create URL
///
/// The trailing `create` path segment is replaced with `delete`; query
/// parameters (e.g. `authKey`) are kept.
pub fn derive_delete_url(create_url: &str) -> Result<String> {
    let mut url = url::Url::parse(create_url)
        .map_err(|e| Error::Config(format!("invalid `snapshot_create_url` {create_url:?}: {e}")))?;

    let ends_with_create = url
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .is_some_and(|last| last == "create");
    if !ends_with_create {
        return Err(Error::Config(format!(
            "cannot derive `snapshot_delete_url` from {create_url:?}: \
             last path segment is not `create`; set it explicitly"
        )));
    }

    url.path_segments_mut()
        .map_err(|_| Error::Config(format!("{create_url:?} cannot be a base URL")))?
        .pop_if_empty()
        .pop()
        .push("delete");

    Ok(url.to_string())
}

/// Parse a duration such as `30d`, `60m`, `1h30m`, `90s` or `2w`
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        if secs == 0 {
            return Err(format!("Duration must be positive: {s}"));
        }
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("Missing unit in duration: {s}"))?;
        if num_end == 0 {
            return Err(format!("Invalid duration: {s}"));
        }
        let num: u64 = rest[..num_end]
            .parse()
            .map_err(|_| format!("Invalid duration number: {}", &rest[..num_end]))?;

        let after = &rest[num_end..];
        let unit_end = after
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(after.len());
        let unit = &after[..unit_end];

        let multiplier = match unit.to_lowercase().as_str() {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86400,
            "w" => 604800,
            _ => return Err(format!("Unknown duration suffix: {unit}")),
        };

        total = num
            .checked_mul(multiplier)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| format!("Duration overflow: {s}"))?;
        rest = &after[unit_end..];
    }

    if total == 0 {
        return Err(format!("Duration must be positive: {s}"));
    }
    Ok(Duration::from_secs(total))
}

/// Parse a byte size such as `0`, `512K`, `8MB` or `1GiB`
pub fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Size cannot be empty".to_string());
    }

    let suffix_start = s.find(|c: char| c.is_ascii_alphabetic()).unwrap_or(s.len());
    let num_str = &s[..suffix_start];
    let suffix = &s[suffix_start..];

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid size number: {num_str}"))?;

    let multiplier: u64 = match suffix.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        "T" | "TB" | "TIB" => 1024 * 1024 * 1024 * 1024,
        _ => return Err(format!("Unknown size suffix: {suffix}")),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| format!("Size overflow: {s}"))
}

/// Render a duration with the largest whole unit, e.g. `30d` or `90m`
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    for (unit, size) in [("w", 604800), ("d", 86400), ("h", 3600), ("m", 60)] {
        if secs >= size && secs % size == 0 {
            return format!("{}{unit}", secs / size);
        }
    }
    format!("{secs}s")
}
