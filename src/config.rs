// Keyfed — Configuration
//
// Runtime settings come from command-line flags with `KEYFED_*`
// environment fallbacks. Durations are humantime strings: `250ms`, `30s`,
// `1h30m`, `2days`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::error::{KeyfedError, Result};
use crate::federation::{FetchConfig, ImportConfig, RetryPolicy};

/// Default database location: `<data dir>/keyfed/keyfed.db`.
pub fn default_db_path() -> PathBuf {
    dirs_next::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("keyfed")
        .join("keyfed.db")
}

/// Settings shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// SQLite database shared by all instances.
    #[arg(long, env = "KEYFED_DATABASE", global = true)]
    pub database: Option<PathBuf>,

    /// Lease holder id for this process. Defaults to a random id.
    #[arg(long, env = "KEYFED_HOLDER_ID", global = true)]
    pub holder_id: Option<String>,

    /// How long a partner lease lasts without renewal.
    #[arg(long, env = "KEYFED_LEASE_TTL", default_value = "15m", value_parser = humantime::parse_duration, global = true)]
    pub lease_ttl: Duration,

    /// Deadline for a single partner cycle. Must be shorter than the lease TTL.
    #[arg(long, env = "KEYFED_MAX_RUNTIME", default_value = "10m", value_parser = humantime::parse_duration, global = true)]
    pub max_runtime: Duration,

    /// Overall budget for one schedule or import trigger.
    #[arg(long, env = "KEYFED_TRIGGER_TIMEOUT", default_value = "30m", value_parser = humantime::parse_duration, global = true)]
    pub trigger_timeout: Duration,

    /// Partners processed concurrently by one schedule pass.
    #[arg(long, env = "KEYFED_WORKER_POOL_SIZE", default_value_t = 4, global = true)]
    pub worker_pool_size: usize,

    /// Consecutive rejected or gapped cycles before an alert.
    #[arg(long, env = "KEYFED_FAILURE_THRESHOLD", default_value_t = 5, global = true)]
    pub failure_threshold: u32,

    /// Disable a partner once it reaches the failure threshold.
    #[arg(long, env = "KEYFED_AUTO_DISABLE", global = true)]
    pub auto_disable: bool,

    #[arg(long, env = "KEYFED_RETRY_MAX_ATTEMPTS", default_value_t = 4, global = true)]
    pub retry_max_attempts: u32,

    #[arg(long, env = "KEYFED_RETRY_INITIAL_BACKOFF", default_value = "250ms", value_parser = humantime::parse_duration, global = true)]
    pub retry_initial_backoff: Duration,

    #[arg(long, env = "KEYFED_RETRY_MAX_BACKOFF", default_value = "10s", value_parser = humantime::parse_duration, global = true)]
    pub retry_max_backoff: Duration,

    #[arg(long, env = "KEYFED_INDEX_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration, global = true)]
    pub index_timeout: Duration,

    #[arg(long, env = "KEYFED_BATCH_TIMEOUT", default_value = "2m", value_parser = humantime::parse_duration, global = true)]
    pub batch_timeout: Duration,

    /// Largest batch or index file accepted, in bytes.
    #[arg(long, env = "KEYFED_MAX_BATCH_BYTES", default_value_t = 32 * 1024 * 1024, global = true)]
    pub max_batch_bytes: usize,

    /// Keys per INSERT statement while merging.
    #[arg(long, env = "KEYFED_MAX_INSERT_BATCH_SIZE", default_value_t = 500, global = true)]
    pub max_insert_batch_size: usize,
}

impl Settings {
    pub fn database_path(&self) -> PathBuf {
        self.database.clone().unwrap_or_else(default_db_path)
    }

    pub fn import_config(&self) -> Result<ImportConfig> {
        let lease_ttl = chrono::Duration::from_std(self.lease_ttl)
            .map_err(|_| KeyfedError::Config("lease ttl is out of range".into()))?;
        if lease_ttl <= chrono::Duration::zero() {
            return Err(KeyfedError::Config("lease ttl must be positive".into()));
        }
        if self.max_runtime.is_zero() {
            return Err(KeyfedError::Config("max runtime must be positive".into()));
        }
        if self.lease_ttl <= self.max_runtime {
            return Err(KeyfedError::Config(format!(
                "lease ttl ({}) must be longer than max runtime ({})",
                humantime::format_duration(self.lease_ttl),
                humantime::format_duration(self.max_runtime),
            )));
        }
        if self.trigger_timeout.is_zero() {
            return Err(KeyfedError::Config("trigger timeout must be positive".into()));
        }
        if self.max_insert_batch_size == 0 {
            return Err(KeyfedError::Config("max insert batch size must be positive".into()));
        }

        let defaults = ImportConfig::default();
        Ok(ImportConfig {
            holder: self.holder_id.clone().unwrap_or(defaults.holder),
            lease_ttl,
            max_runtime: self.max_runtime,
            trigger_timeout: self.trigger_timeout,
            failure_threshold: self.failure_threshold.max(1),
            auto_disable: self.auto_disable,
            max_insert_batch_size: self.max_insert_batch_size,
        })
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                initial_backoff: self.retry_initial_backoff,
                max_backoff: self.retry_max_backoff,
                ..RetryPolicy::default()
            },
            index_timeout: self.index_timeout,
            batch_timeout: self.batch_timeout,
            max_bytes: self.max_batch_bytes,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        settings: Settings,
    }

    fn parse(args: &[&str]) -> Settings {
        let mut argv = vec!["keyfed"];
        argv.extend_from_slice(args);
        TestCli::try_parse_from(argv).unwrap().settings
    }

    #[test]
    fn test_humane_durations() {
        let settings = parse(&[
            "--lease-ttl",
            "1h30m",
            "--max-runtime",
            "90min",
            "--retry-initial-backoff",
            "250ms",
            "--batch-timeout",
            "10min",
        ]);
        assert_eq!(settings.lease_ttl, Duration::from_secs(5400));
        assert_eq!(settings.max_runtime, Duration::from_secs(5400));
        assert_eq!(settings.retry_initial_backoff, Duration::from_millis(250));
        assert_eq!(settings.batch_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_invalid_durations_rejected() {
        for bad in ["", "soon", "5 fortnights", "-5s", "45"] {
            let result = TestCli::try_parse_from(["keyfed", "--lease-ttl", bad]);
            assert!(result.is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_defaults() {
        let settings = parse(&[]);
        let import = settings.import_config().unwrap();
        assert_eq!(import.lease_ttl, chrono::Duration::minutes(15));
        assert_eq!(import.max_runtime, Duration::from_secs(600));
        assert_eq!(import.trigger_timeout, Duration::from_secs(1800));
        assert_eq!(import.failure_threshold, 5);
        assert!(!import.auto_disable);
        assert!(import.holder.starts_with("keyfed-"));

        let fetch = settings.fetch_config();
        assert_eq!(fetch.retry.max_attempts, 4);
        assert_eq!(fetch.batch_timeout, Duration::from_secs(120));
        assert_eq!(settings.worker_pool_size, 4);
    }

    #[test]
    fn test_flags_override_defaults() {
        let settings = parse(&[
            "--lease-ttl",
            "5m",
            "--max-runtime",
            "2m",
            "--holder-id",
            "instance-a",
            "--auto-disable",
            "--max-insert-batch-size",
            "100",
        ]);
        let import = settings.import_config().unwrap();
        assert_eq!(import.lease_ttl, chrono::Duration::minutes(5));
        assert_eq!(import.max_runtime, Duration::from_secs(120));
        assert_eq!(import.holder, "instance-a");
        assert!(import.auto_disable);
        assert_eq!(import.max_insert_batch_size, 100);
    }

    #[test]
    fn test_lease_ttl_must_outlast_max_runtime() {
        let settings = parse(&["--lease-ttl", "1m", "--max-runtime", "10m"]);
        assert!(matches!(settings.import_config(), Err(KeyfedError::Config(_))));

        let settings = parse(&["--lease-ttl", "10m", "--max-runtime", "10m"]);
        assert!(matches!(settings.import_config(), Err(KeyfedError::Config(_))));

        let settings = parse(&["--lease-ttl", "11m", "--max-runtime", "10m"]);
        assert!(settings.import_config().is_ok());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let settings = parse(&["--lease-ttl", "0s"]);
        assert!(matches!(settings.import_config(), Err(KeyfedError::Config(_))));
    }
}
