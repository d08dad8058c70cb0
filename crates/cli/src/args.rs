//! Command-line arguments
//!
//! Every setting can also come from the environment or from the TOML config
//! file; flags and environment override the file.

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use sk_core::SettingsBuilder;

/// Scheduled database snapshot backups with retention cleanup
#[derive(Parser, Debug)]
#[command(name = "snapkeeper", version, about, long_about = None)]
pub struct Cli {
    /// TOML config file [default: <config dir>/snapkeeper/config.toml if present]
    #[arg(long, env = "SNAPKEEPER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to the database storage data [default: victoria-metrics-data]
    #[arg(long, env = "SNAPKEEPER_STORAGE_DATA_PATH")]
    pub storage_data_path: Option<PathBuf>,

    /// Name of an existing snapshot to back up on every cycle
    #[arg(long, env = "SNAPKEEPER_SNAPSHOT_NAME")]
    pub snapshot_name: Option<String>,

    /// Snapshot create URL; a fresh snapshot is created and deleted per cycle
    #[arg(long, env = "SNAPKEEPER_SNAPSHOT_CREATE_URL")]
    pub snapshot_create_url: Option<String>,

    /// Snapshot delete URL [default: derived from the create URL]
    #[arg(long, env = "SNAPKEEPER_SNAPSHOT_DELETE_URL")]
    pub snapshot_delete_url: Option<String>,

    /// Backup destination (fs:///path or s3://bucket/prefix)
    #[arg(long, env = "SNAPKEEPER_DST")]
    pub dst: Option<String>,

    /// Previous backup to copy unchanged parts from server-side
    #[arg(long, env = "SNAPKEEPER_ORIGIN")]
    pub origin: Option<String>,

    /// Parts transferred concurrently [default: 10]
    #[arg(long, env = "SNAPKEEPER_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Source read limit per second (e.g., 0, 512K, 8MB) [default: unlimited]
    #[arg(long, env = "SNAPKEEPER_MAX_BYTES_PER_SECOND")]
    pub max_bytes_per_second: Option<String>,

    /// Backups older than this are deleted (e.g., 24h, 30d, 2w) [default: 30d]
    #[arg(long, env = "SNAPKEEPER_RETENTION")]
    pub retention: Option<String>,

    /// Time between cycle starts (e.g., 60m, 6h) [default: 60m]
    #[arg(long, env = "SNAPKEEPER_INTERVAL")]
    pub interval: Option<String>,

    /// Upper bound for the transfer step of one cycle
    #[arg(long, env = "SNAPKEEPER_MAX_CYCLE_DURATION")]
    pub max_cycle_duration: Option<String>,

    /// Cycles allowed to run at once (0 = unbounded) [default: 0]
    #[arg(long, env = "SNAPKEEPER_MAX_CONCURRENT_CYCLES")]
    pub max_concurrent_cycles: Option<usize>,

    /// Object-storage access key
    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub access_key: Option<String>,

    /// Object-storage secret key
    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Object-storage region [default: us-east-1]
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Custom S3 endpoint for S3-compatible services
    #[arg(long = "custom-s3-endpoint", env = "SNAPKEEPER_CUSTOM_S3_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Use path-style addressing [default: true]
    #[arg(
        long = "s3-force-path-style",
        env = "SNAPKEEPER_S3_FORCE_PATH_STYLE",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub force_path_style: Option<bool>,

    /// Attempts per snapshot API call [default: 3]
    #[arg(long, env = "SNAPKEEPER_RETRY_ATTEMPTS")]
    pub retry_attempts: Option<u32>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Cli {
    /// The settings layer given by flags and environment
    pub fn settings_layer(&self) -> SettingsBuilder {
        SettingsBuilder {
            storage_data_path: self.storage_data_path.clone(),
            snapshot_name: self.snapshot_name.clone(),
            snapshot_create_url: self.snapshot_create_url.clone(),
            snapshot_delete_url: self.snapshot_delete_url.clone(),
            dst: self.dst.clone(),
            origin: self.origin.clone(),
            concurrency: self.concurrency,
            max_bytes_per_second: self.max_bytes_per_second.clone(),
            retention: self.retention.clone(),
            interval: self.interval.clone(),
            max_cycle_duration: self.max_cycle_duration.clone(),
            max_concurrent_cycles: self.max_concurrent_cycles,
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
            force_path_style: self.force_path_style,
            retry_attempts: self.retry_attempts,
        }
    }

    /// Default log filter when `RUST_LOG` is unset
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "warn";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_flags_become_settings_layer() {
        let cli = Cli::try_parse_from([
            "snapkeeper",
            "--snapshot-create-url",
            "http://vm:8428/snapshot/create",
            "--dst",
            "s3://backups/vm",
            "--concurrency",
            "4",
            "--max-bytes-per-second",
            "8MB",
            "--s3-force-path-style",
            "false",
            "-vv",
        ])
        .unwrap();

        let layer = cli.settings_layer();
        assert_eq!(layer.dst.as_deref(), Some("s3://backups/vm"));
        assert_eq!(layer.concurrency, Some(4));
        assert_eq!(layer.max_bytes_per_second.as_deref(), Some("8MB"));
        assert_eq!(layer.force_path_style, Some(false));
        assert_eq!(cli.log_level(), "trace");
    }

    #[test]
    fn test_environment_names_are_namespaced() {
        let command = Cli::command();
        let envs: Vec<String> = command
            .get_arguments()
            .filter_map(|arg| arg.get_env())
            .map(|env| env.to_string_lossy().into_owned())
            .collect();

        assert!(envs.contains(&"SNAPKEEPER_DST".to_string()));
        assert!(envs.contains(&"SNAPKEEPER_RETENTION".to_string()));
        assert!(envs.contains(&"AWS_ACCESS_KEY_ID".to_string()));
        for env in &envs {
            assert!(
                env.starts_with("SNAPKEEPER_") || env.starts_with("AWS_"),
                "{env} is not namespaced"
            );
        }
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["snapkeeper", "-q", "-v"]).is_err());
        let cli = Cli::try_parse_from(["snapkeeper", "-q"]).unwrap();
        assert_eq!(cli.log_level(), "warn");
    }
}
